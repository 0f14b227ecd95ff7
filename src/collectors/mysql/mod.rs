use crate::analyzers::wait_chain::WaitChainAnalyzer;
use crate::collectors::util::CounterWindow;
use crate::collectors::{CollectorSettings, LockCollector};
use crate::error::{AnalysisError, CollectionCall, CollectionError};
use crate::model::{LockSnapshot, LockStatistics, WaitChain};
use crate::pool::{DatabaseId, DbPool};
use futures::future::BoxFuture;
use sqlx::{Connection, MySqlPool, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info_span, instrument, warn};
use tracing_futures::Instrument as _;

mod chains;
mod locks;
mod statistics;

/// Reads InnoDB lock state from `performance_schema.data_locks`,
/// `data_lock_waits`, `information_schema.innodb_trx` and `INNODB_METRICS`.
/// Requires MySQL 8.0.17 or newer. Sessions are identified by InnoDB
/// transaction id, with the connection thread id as process id.
pub struct MySqlCollector {
    pool: MySqlPool,
    database_id: DatabaseId,
    settings: CollectorSettings,
    chains: WaitChainAnalyzer,
    deadlocks: CounterWindow,
    timeouts: CounterWindow,
}

impl MySqlCollector {
    #[must_use]
    pub fn new(pool: MySqlPool, database_id: DatabaseId, settings: CollectorSettings) -> Self {
        Self {
            pool,
            database_id,
            chains: WaitChainAnalyzer::new(settings.chains.clone()),
            settings,
            deadlocks: CounterWindow::default(),
            timeouts: CounterWindow::default(),
        }
    }

    /// # Errors
    ///
    /// Returns [`AnalysisError::BackendMismatch`] unless `pool` is a MySQL
    /// pool.
    pub fn from_pool(
        pool: DbPool,
        database_id: DatabaseId,
        settings: CollectorSettings,
    ) -> Result<Self, AnalysisError> {
        match pool {
            DbPool::MySql(pool) => Ok(Self::new(pool, database_id, settings)),
            other => Err(AnalysisError::BackendMismatch {
                backend: "mysql".to_string(),
                pool: other.kind(),
            }),
        }
    }
}

impl LockCollector for MySqlCollector {
    fn backend(&self) -> &'static str {
        "mysql"
    }

    fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    #[instrument(skip(self), level = "debug", fields(backend = "mysql", database = %self.database_id))]
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
        fields(backend = "mysql", database = %self.database_id, otel.kind = "internal")
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
        fields(backend = "mysql", database = %self.database_id, otel.kind = "internal")
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
        fields(backend = "mysql", database = %self.database_id, otel.kind = "internal")
    )]
    fn collect_statistics(
        &self,
        window: Duration,
    ) -> BoxFuture<'_, Result<LockStatistics, CollectionError>> {
        Box::pin(async move {
            let counters = statistics::Counters {
                deadlocks: &self.deadlocks,
                timeouts: &self.timeouts,
            };
            statistics::fetch(&self.pool, &counters, window)
                .await
                .map_err(|e| CollectionError::from_sqlx(CollectionCall::Statistics, &e))
        })
    }

    fn diagnostics(&self) -> BoxFuture<'_, BTreeMap<String, String>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                otel.kind = "client",
                db.system = "mysql",
                db.operation = "SELECT",
                db.statement = "SELECT VERSION(), @@innodb_lock_wait_timeout, @@innodb_deadlock_detect"
            );

            let row = sqlx::query(
                r"
                SELECT
                    CAST(VERSION() AS CHAR) AS server_version,
                    CAST(@@innodb_lock_wait_timeout AS CHAR) AS lock_wait_timeout,
                    CAST(@@innodb_deadlock_detect AS CHAR) AS deadlock_detect
                ",
            )
            .fetch_one(&self.pool)
            .instrument(span)
            .await;

            let mut out = BTreeMap::new();
            match row {
                Ok(row) => {
                    for key in ["server_version", "lock_wait_timeout", "deadlock_detect"] {
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
        let pool = MySqlPoolOptions::new().connect_lazy("mysql://root@localhost/shop")?;
        let collector = MySqlCollector::from_pool(
            DbPool::MySql(pool),
            DatabaseId::from("shop"),
            CollectorSettings::default(),
        )?;
        assert_eq!(collector.backend(), "mysql");
        assert_eq!(collector.database_id().as_str(), "shop");
        Ok(())
    }

    #[tokio::test]
    async fn test_from_postgres_pool_rejected() -> anyhow::Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/postgres")?;
        let result = MySqlCollector::from_pool(
            DbPool::Postgres(pool),
            DatabaseId::from("shop"),
            CollectorSettings::default(),
        );
        assert!(matches!(
            result,
            Err(AnalysisError::BackendMismatch { pool: "postgresql", .. })
        ));
        Ok(())
    }
}
