use crate::analyzers::wait_chain::WaitChainAnalyzer;
use crate::collectors::util::CounterWindow;
use crate::collectors::{CollectorSettings, LockCollector};
use crate::error::{AnalysisError, CollectionCall, CollectionError};
use crate::model::{LockSnapshot, LockStatistics, WaitChain};
use crate::pool::{DatabaseId, DbPool};
use futures::future::BoxFuture;
use sqlx::{Connection, PgPool, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info_span, instrument, warn};
use tracing_futures::Instrument as _;

mod chains;
mod locks;
mod statistics;

/// Reads lock state from `pg_locks`, `pg_stat_activity` and
/// `pg_stat_database`. Requires PostgreSQL 14 or newer (`pg_locks.waitstart`).
pub struct PostgresCollector {
    pool: PgPool,
    database_id: DatabaseId,
    settings: CollectorSettings,
    chains: WaitChainAnalyzer,
    deadlocks: CounterWindow,
}

impl PostgresCollector {
    #[must_use]
    pub fn new(pool: PgPool, database_id: DatabaseId, settings: CollectorSettings) -> Self {
        Self {
            pool,
            database_id,
            chains: WaitChainAnalyzer::new(settings.chains.clone()),
            settings,
            deadlocks: CounterWindow::default(),
        }
    }

    /// # Errors
    ///
    /// Returns [`AnalysisError::BackendMismatch`] unless `pool` is a
    /// PostgreSQL pool.
    pub fn from_pool(
        pool: DbPool,
        database_id: DatabaseId,
        settings: CollectorSettings,
    ) -> Result<Self, AnalysisError> {
        match pool {
            DbPool::Postgres(pool) => Ok(Self::new(pool, database_id, settings)),
            other => Err(AnalysisError::BackendMismatch {
                backend: "postgresql".to_string(),
                pool: other.kind(),
            }),
        }
    }
}

impl LockCollector for PostgresCollector {
    fn backend(&self) -> &'static str {
        "postgresql"
    }

    fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    #[instrument(skip(self), level = "debug", fields(backend = "postgresql", database = %self.database_id))]
    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.pool.acquire().await {
                Ok(mut conn) => match conn.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "ping failed");
                        false
                    }
                },
                Err(e) => {
                    warn!(error = %e, "failed to acquire connection");
                    false
                }
            }
        })
    }

    #[instrument(
        skip(self),
        level = "info",
        err,
        fields(backend = "postgresql", database = %self.database_id, otel.kind = "internal")
    )]
    fn collect_current_locks(&self) -> BoxFuture<'_, Result<Vec<LockSnapshot>, CollectionError>> {
        Box::pin(async move {
            let locks = locks::fetch(&self.pool, &self.settings)
                .await
                .map_err(|e| CollectionError::from_sqlx(CollectionCall::Locks, &e))?;

            debug!(locks = locks.len(), "collected locks");

            Ok(locks)
        })
    }

    #[instrument(
        skip(self),
        level = "info",
        err,
        fields(backend = "postgresql", database = %self.database_id, otel.kind = "internal")
    )]
    fn collect_wait_chains(&self) -> BoxFuture<'_, Result<Vec<WaitChain>, CollectionError>> {
        Box::pin(async move {
            let sessions = chains::fetch(&self.pool, &self.settings)
                .await
                .map_err(|e| CollectionError::from_sqlx(CollectionCall::WaitChains, &e))?;

            let chains = self.chains.from_sessions(sessions);

            debug!(chains = chains.len(), "reconstructed wait chains");

            Ok(chains)
        })
    }

    #[instrument(
        skip(self),
        level = "info",
        err,
        fields(backend = "postgresql", database = %self.database_id, otel.kind = "internal")
    )]
    fn collect_statistics(
        &self,
        window: Duration,
    ) -> BoxFuture<'_, Result<LockStatistics, CollectionError>> {
        Box::pin(async move {
            statistics::fetch(&self.pool, &self.settings, &self.deadlocks, window)
                .await
                .map_err(|e| CollectionError::from_sqlx(CollectionCall::Statistics, &e))
        })
    }

    fn diagnostics(&self) -> BoxFuture<'_, BTreeMap<String, String>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                otel.kind = "client",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = "SELECT current_setting(server_version | lock_timeout | deadlock_timeout)"
            );

            let row = sqlx::query(
                r"
                SELECT
                    current_setting('server_version') AS server_version,
                    current_setting('lock_timeout') AS lock_timeout,
                    current_setting('deadlock_timeout') AS deadlock_timeout
                ",
            )
            .fetch_one(&self.pool)
            .instrument(span)
            .await;

            let mut out = BTreeMap::new();
            match row {
                Ok(row) => {
                    for key in ["server_version", "lock_timeout", "deadlock_timeout"] {
                        if let Ok(value) = row.try_get::<String, _>(key) {
                            out.insert(key.to_string(), value);
                        }
                    }
                }
                Err(e) => debug!(error = %e, "diagnostics query failed"),
            }
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::mysql::MySqlPoolOptions;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn test_from_pool() -> anyhow::Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/postgres")?;
        let collector = PostgresCollector::from_pool(
            DbPool::Postgres(pool),
            DatabaseId::from("pg"),
            CollectorSettings::default(),
        )?;
        assert_eq!(collector.backend(), "postgresql");
        Ok(())
    }

    #[tokio::test]
    async fn test_from_mysql_pool_rejected() -> anyhow::Result<()> {
        let pool = MySqlPoolOptions::new().connect_lazy("mysql://root@localhost/shop")?;
        let result = PostgresCollector::from_pool(
            DbPool::MySql(pool),
            DatabaseId::from("pg"),
            CollectorSettings::default(),
        );
        assert!(matches!(
            result,
            Err(AnalysisError::BackendMismatch { pool: "mysql", .. })
        ));
        Ok(())
    }
}
