use crate::cache::{CacheError, glob_to_like, glob_matches};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span, instrument};
use tracing_futures::Instrument as _;

/// Cache tier shared between processes. Values are JSON text.
pub trait SharedStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Delete keys matching a `*` glob and return the deleted keys.
    fn invalidate<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Result<Vec<String>, CacheError>>;
}

/// In-process stand-in for a shared tier. Useful for single-node deployments
/// and tests.
#[derive(Default)]
pub struct MemorySharedStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemorySharedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharedStore for MemorySharedStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock();

            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
                Some(_) => {
                    entries.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.entries
                .lock()
                .insert(key.to_string(), (value, Instant::now() + ttl));
            Ok(())
        })
    }

    fn invalidate<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock();
            let mut keys = Vec::new();

            entries.retain(|key, (_, expires_at)| {
                if !glob_matches(pattern, key) {
                    return true;
                }
                if *expires_at > now {
                    keys.push(key.clone());
                }
                false
            });

            keys.sort();
            Ok(keys)
        })
    }
}

/// Shared tier kept in an UNLOGGED PostgreSQL table.
///
/// Expired rows are filtered on read and purged opportunistically on write.
#[derive(Clone)]
pub struct PgSharedStore {
    pool: PgPool,
    table: String,
}

impl PgSharedStore {
    pub const DEFAULT_TABLE: &'static str = "lockscope_cache";

    /// Use `table` (created if missing) in the database behind `pool`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table name is not a plain identifier or the
    /// table cannot be created.
    #[instrument(skip(pool), level = "info", err, fields(otel.kind = "internal"))]
    pub async fn connect(pool: PgPool, table: &str) -> Result<Self, CacheError> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CacheError::Backend(format!("invalid cache table name '{table}'")));
        }

        let store = Self {
            pool,
            table: table.to_string(),
        };

        let ddl = format!(
            "CREATE UNLOGGED TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )",
            store.table
        );

        let span = info_span!(
            "db.query",
            otel.kind = "client",
            db.system = "postgresql",
            db.operation = "CREATE",
            db.statement = "CREATE UNLOGGED TABLE IF NOT EXISTS cache",
            db.sql.table = %store.table
        );

        sqlx::query(&ddl)
            .execute(&store.pool)
            .instrument(span)
            .await?;

        debug!(table = %store.table, "shared cache table ready");

        Ok(store)
    }
}

impl SharedStore for PgSharedStore {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                otel.kind = "client",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = "SELECT value FROM cache WHERE key = $1",
                db.sql.table = %self.table
            );

            let sql = format!(
                "SELECT value::text AS value FROM {} WHERE key = $1 AND expires_at > now()",
                self.table
            );

            let row = sqlx::query(&sql)
                .bind(key)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await?;

            match row {
                Some(row) => Ok(Some(row.try_get("value")?)),
                None => Ok(None),
            }
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                otel.kind = "client",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = "INSERT INTO cache ... ON CONFLICT (key) DO UPDATE",
                db.sql.table = %self.table
            );

            let sql = format!(
                "INSERT INTO {} (key, value, expires_at)
                 VALUES ($1, $2::jsonb, now() + make_interval(secs => $3))
                 ON CONFLICT (key) DO UPDATE
                 SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
                self.table
            );

            sqlx::query(&sql)
                .bind(key)
                .bind(value)
                .bind(ttl.as_secs_f64())
                .execute(&self.pool)
                .instrument(span)
                .await?;

            let span = info_span!(
                "db.query",
                otel.kind = "client",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = "DELETE FROM cache WHERE expires_at <= now()",
                db.sql.table = %self.table
            );

            let purge = format!("DELETE FROM {} WHERE expires_at <= now()", self.table);
            sqlx::query(&purge)
                .execute(&self.pool)
                .instrument(span)
                .await?;

            Ok(())
        })
    }

    fn invalidate<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                otel.kind = "client",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = "DELETE FROM cache WHERE key LIKE $1 RETURNING live keys",
                db.sql.table = %self.table
            );

            // Expired rows are deleted too but only live keys are reported.
            let sql = format!(
                "WITH gone AS (
                     DELETE FROM {} WHERE key LIKE $1 ESCAPE '\\' RETURNING key, expires_at
                 )
                 SELECT key FROM gone WHERE expires_at > now() ORDER BY key",
                self.table
            );

            let rows = sqlx::query(&sql)
                .bind(glob_to_like(pattern))
                .fetch_all(&self.pool)
                .instrument(span)
                .await?;

            let mut keys = Vec::with_capacity(rows.len());
            for row in &rows {
                keys.push(row.try_get("key")?);
            }

            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expiry() -> Result<(), CacheError> {
        let store = MemorySharedStore::new();
        store.set("k", "1".to_string(), Duration::from_secs(5)).await?;

        assert_eq!(store.get("k").await?.as_deref(), Some("1"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await?, None);
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_invalidate() -> Result<(), CacheError> {
        let store = MemorySharedStore::new();
        let ttl = Duration::from_secs(60);
        store.set("lockscope:live:a:locks", "[]".to_string(), ttl).await?;
        store.set("lockscope:analysis:a:w60", "{}".to_string(), ttl).await?;
        store.set("lockscope:analysis:b:w60", "{}".to_string(), ttl).await?;

        let mut removed = store.invalidate("lockscope:*:a:*").await?;
        removed.sort();

        assert_eq!(
            removed,
            vec!["lockscope:analysis:a:w60", "lockscope:live:a:locks"]
        );
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected() -> anyhow::Result<()> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://postgres@localhost:5432/postgres")?;
        let result = PgSharedStore::connect(pool, "cache; DROP TABLE x").await;
        assert!(matches!(result, Err(CacheError::Backend(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_invalidate_skips_expired() -> Result<(), CacheError> {
        let store = MemorySharedStore::new();
        store.set("lockscope:live:a:locks", "[]".to_string(), Duration::from_secs(5)).await?;
        store
            .set("lockscope:analysis:a:w60", "{}".to_string(), Duration::from_secs(300))
            .await?;

        tokio::time::advance(Duration::from_secs(10)).await;
        let removed = store.invalidate("lockscope:*:a:*").await?;

        assert_eq!(removed, vec!["lockscope:analysis:a:w60"]);
        assert!(store.entries.lock().is_empty());
        Ok(())
    }
}
