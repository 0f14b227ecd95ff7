use crate::collectors::{BackendConstructor, CollectorSettings, LockCollector, all_backends};
use crate::error::AnalysisError;
use crate::pool::{DatabaseId, DbPool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Resolves a backend name to its collector constructor.
#[derive(Clone)]
pub struct BackendRegistry {
    constructors: HashMap<&'static str, BackendConstructor>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            constructors: all_backends(),
        }
    }

    /// Build the collector for `backend` on top of an existing pool.
    ///
    /// # Errors
    ///
    /// [`AnalysisError::UnsupportedBackend`] for unknown names and
    /// [`AnalysisError::BackendMismatch`] when the pool belongs to another
    /// backend.
    pub fn create(
        &self,
        backend: &str,
        pool: DbPool,
        id: DatabaseId,
        settings: CollectorSettings,
    ) -> Result<Arc<dyn LockCollector>, AnalysisError> {
        let constructor = self
            .constructors
            .get(backend)
            .ok_or_else(|| AnalysisError::UnsupportedBackend(backend.to_string()))?;

        debug!(backend, database = %id, "creating collector");

        constructor(pool, id, settings)
    }

    #[must_use]
    pub fn supports(&self, backend: &str) -> bool {
        self.constructors.contains_key(backend)
    }

    /// Supported backend names, sorted.
    #[must_use]
    pub fn list_supported_types(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.constructors.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn test_list_supported_types() {
        let registry = BackendRegistry::new();
        assert_eq!(registry.list_supported_types(), vec!["mysql", "postgresql"]);
        assert!(registry.supports("postgresql"));
        assert!(!registry.supports("oracle"));
    }

    #[tokio::test]
    async fn test_unsupported_backend() -> anyhow::Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/postgres")?;
        let result = BackendRegistry::new().create(
            "oracle",
            DbPool::Postgres(pool),
            DatabaseId::from("db"),
            CollectorSettings::default(),
        );
        assert!(matches!(result, Err(AnalysisError::UnsupportedBackend(name)) if name == "oracle"));
        Ok(())
    }

    #[tokio::test]
    async fn test_backend_pool_mismatch() -> anyhow::Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/postgres")?;
        let result = BackendRegistry::new().create(
            "mysql",
            DbPool::Postgres(pool),
            DatabaseId::from("db"),
            CollectorSettings::default(),
        );
        assert!(matches!(
            result,
            Err(AnalysisError::BackendMismatch { ref backend, pool: "postgresql" }) if backend == "mysql"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_postgres_collector() -> anyhow::Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/postgres")?;
        let collector = BackendRegistry::new().create(
            "postgresql",
            DbPool::Postgres(pool),
            DatabaseId::from("primary"),
            CollectorSettings::default(),
        )?;
        assert_eq!(collector.backend(), "postgresql");
        assert_eq!(collector.database_id().as_str(), "primary");
        Ok(())
    }
}
