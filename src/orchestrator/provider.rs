use crate::collectors::registry::BackendRegistry;
use crate::collectors::{CollectorSettings, LockCollector};
use crate::error::AnalysisError;
use crate::policy::AnalysisPolicy;
use crate::pool::{DatabaseId, DbPool, PoolManager, SqlxPoolFactory, TargetConfig};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Hands out the collector for a database identity.
pub trait CollectorProvider: Send + Sync {
    fn acquire<'a>(
        &'a self,
        database_id: &'a DatabaseId,
    ) -> BoxFuture<'a, Result<Arc<dyn LockCollector>, AnalysisError>>;

    /// Release every connection the provider holds.
    fn close_all(&self) -> BoxFuture<'_, ()>;
}

/// Production provider: known targets, one pool per target and one collector
/// per pool.
///
/// Collectors are kept across analyses because they carry the counter
/// readings that windowed counts are computed from. A collector whose pool
/// was replaced after a failed health check is rebuilt.
pub struct PooledCollectorProvider {
    targets: RwLock<HashMap<DatabaseId, Arc<TargetConfig>>>,
    pools: PoolManager<SqlxPoolFactory>,
    registry: BackendRegistry,
    settings: CollectorSettings,
    collectors: Mutex<HashMap<DatabaseId, (DbPool, Arc<dyn LockCollector>)>>,
}

impl PooledCollectorProvider {
    #[must_use]
    pub fn new(policy: &AnalysisPolicy) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            pools: PoolManager::new(SqlxPoolFactory::new(policy.pool.clone()), policy.pool.clone()),
            registry: BackendRegistry::new(),
            settings: CollectorSettings::from_policy(policy),
            collectors: Mutex::new(HashMap::new()),
        }
    }

    /// Make `target` available under its identity.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::UnsupportedBackend`] if no collector exists
    /// for the target's backend.
    pub fn register(&self, target: TargetConfig) -> Result<DatabaseId, AnalysisError> {
        if !self.registry.supports(&target.backend) {
            return Err(AnalysisError::UnsupportedBackend(target.backend));
        }

        let id = target.id.clone();
        info!(database = %id, backend = %target.backend, "target registered");
        self.targets.write().insert(id.clone(), Arc::new(target));
        Ok(id)
    }

    #[must_use]
    pub fn targets(&self) -> Vec<DatabaseId> {
        let mut ids: Vec<DatabaseId> = self.targets.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn cached(&self, id: &DatabaseId) -> Option<Arc<dyn LockCollector>> {
        self.collectors
            .lock()
            .get(id)
            .filter(|(pool, _)| !pool.is_closed())
            .map(|(_, collector)| Arc::clone(collector))
    }
}

impl CollectorProvider for PooledCollectorProvider {
    #[instrument(skip(self), level = "debug", err, fields(database = %database_id))]
    fn acquire<'a>(
        &'a self,
        database_id: &'a DatabaseId,
    ) -> BoxFuture<'a, Result<Arc<dyn LockCollector>, AnalysisError>> {
        Box::pin(async move {
            let target = self
                .targets
                .read()
                .get(database_id)
                .cloned()
                .ok_or_else(|| AnalysisError::UnknownDatabase(database_id.to_string()))?;

            let pool = self.pools.get_or_create(&target).await?;

            if let Some(collector) = self.cached(database_id) {
                return Ok(collector);
            }

            let collector = self.registry.create(
                &target.backend,
                pool.clone(),
                database_id.clone(),
                self.settings.clone(),
            )?;

            debug!(database = %database_id, backend = collector.backend(), "collector ready");
            self.collectors
                .lock()
                .insert(database_id.clone(), (pool, Arc::clone(&collector)));

            Ok(collector)
        })
    }

    fn close_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.collectors.lock().clear();
            self.pools.close_all().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn target(dsn: &str) -> anyhow::Result<TargetConfig> {
        TargetConfig::from_dsn(
            &SecretString::from(dsn.to_string()),
            None,
            &AnalysisPolicy::default().pool,
        )
    }

    #[tokio::test]
    async fn test_unknown_database() {
        let provider = PooledCollectorProvider::new(&AnalysisPolicy::default());
        let err = provider.acquire(&DatabaseId::from("nope")).await.err();
        assert!(matches!(err, Some(AnalysisError::UnknownDatabase(_))));
    }

    #[test]
    fn test_register_lists_targets() -> anyhow::Result<()> {
        let provider = PooledCollectorProvider::new(&AnalysisPolicy::default());
        provider.register(target("mysql://root@db2:3306/shop")?)?;
        provider.register(target("postgresql://app@db1:5432/orders")?)?;

        assert_eq!(
            provider.targets(),
            vec![DatabaseId::from("orders@db1:5432"), DatabaseId::from("shop@db2:3306")]
        );
        Ok(())
    }
}
