use super::{PoolFactory, TargetConfig};
use crate::policy::PoolPolicy;
use anyhow::{Context, Result, anyhow};
use futures::future::BoxFuture;
use secrecy::ExposeSecret;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

/// Pool handle for one of the supported backends.
#[derive(Clone, Debug)]
pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl DbPool {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgresql",
            Self::MySql(_) => "mysql",
        }
    }

    pub async fn ping(&self) -> bool {
        let res = match self {
            Self::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            Self::MySql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        };

        if let Err(ref e) = res {
            debug!(backend = self.kind(), error = %e, "ping failed");
        }

        res.is_ok()
    }

    /// Whether the pool was closed, e.g. after failing a health probe.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Postgres(pool) => pool.is_closed(),
            Self::MySql(pool) => pool.is_closed(),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::MySql(pool) => pool.close().await,
        }
    }
}

/// Builds sqlx pools from [`TargetConfig`]s.
#[derive(Clone, Debug, Default)]
pub struct SqlxPoolFactory {
    policy: PoolPolicy,
}

impl SqlxPoolFactory {
    #[must_use]
    pub const fn new(policy: PoolPolicy) -> Self {
        Self { policy }
    }

    async fn connect_postgres(&self, target: &TargetConfig) -> Result<DbPool> {
        let mut opts = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.username)
            .database(&target.database)
            .application_name(env!("CARGO_PKG_NAME"));

        if let Some(password) = &target.password {
            opts = opts.password(password.expose_secret());
        }

        let pool = PgPoolOptions::new()
            .min_connections(target.min_connections)
            .max_connections(target.max_connections)
            .acquire_timeout(Duration::from_millis(self.policy.acquire_timeout_ms))
            .max_lifetime(Duration::from_secs(self.policy.max_lifetime_secs))
            .connect_with(opts)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(DbPool::Postgres(pool))
    }

    async fn connect_mysql(&self, target: &TargetConfig) -> Result<DbPool> {
        let mut opts = MySqlConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.username)
            .database(&target.database);

        if let Some(password) = &target.password {
            opts = opts.password(password.expose_secret());
        }

        let pool = MySqlPoolOptions::new()
            .min_connections(target.min_connections)
            .max_connections(target.max_connections)
            .acquire_timeout(Duration::from_millis(self.policy.acquire_timeout_ms))
            .max_lifetime(Duration::from_secs(self.policy.max_lifetime_secs))
            .connect_with(opts)
            .await
            .context("Failed to connect to MySQL")?;

        Ok(DbPool::MySql(pool))
    }
}

impl PoolFactory for SqlxPoolFactory {
    type Pool = DbPool;

    fn connect<'a>(&'a self, target: &'a TargetConfig) -> BoxFuture<'a, Result<DbPool>> {
        Box::pin(async move {
            let span = info_span!(
                "db.connect",
                otel.kind = "client",
                db.system = %target.backend,
                db.name = %target.database,
                server.address = %target.host,
                server.port = target.port
            );

            let connect = async {
                match target.backend.as_str() {
                    "postgresql" => self.connect_postgres(target).await,
                    "mysql" => self.connect_mysql(target).await,
                    other => Err(anyhow!("no pool driver for backend '{other}'")),
                }
            };

            let deadline = Duration::from_millis(self.policy.acquire_timeout_ms);
            match timeout(deadline, connect.instrument(span)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!(
                    "Failed to connect to {}: timed out after {}ms",
                    target.id,
                    deadline.as_millis()
                )),
            }
        })
    }

    fn probe<'a>(&'a self, pool: &'a DbPool) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let deadline = Duration::from_millis(self.policy.probe_timeout_ms);
            timeout(deadline, pool.ping()).await.unwrap_or(false)
        })
    }

    fn close<'a>(&'a self, pool: &'a DbPool) -> BoxFuture<'a, ()> {
        Box::pin(pool.close())
    }
}
