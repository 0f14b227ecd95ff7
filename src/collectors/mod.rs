use crate::error::{AnalysisError, CollectionError};
use crate::model::{LockSnapshot, LockStatistics, WaitChain};
use crate::policy::{AnalysisPolicy, ChainThresholds};
use crate::pool::{DatabaseId, DbPool};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[macro_use]
mod register_macro;

/// Backend-specific source of lock data for one target database.
///
/// Implementations never panic on database errors; every failure comes back
/// as a [`CollectionError`] tagged with the call that raised it.
pub trait LockCollector: Send + Sync {
    fn backend(&self) -> &'static str;

    fn database_id(&self) -> &DatabaseId;

    fn health_check(&self) -> BoxFuture<'_, bool>;

    fn collect_current_locks(&self) -> BoxFuture<'_, Result<Vec<LockSnapshot>, CollectionError>>;

    fn collect_wait_chains(&self) -> BoxFuture<'_, Result<Vec<WaitChain>, CollectionError>>;

    fn collect_statistics(
        &self,
        window: Duration,
    ) -> BoxFuture<'_, Result<LockStatistics, CollectionError>>;

    /// Free-form server metadata (version, settings) attached to results.
    fn diagnostics(&self) -> BoxFuture<'_, BTreeMap<String, String>> {
        Box::pin(async { BTreeMap::new() })
    }
}

/// Knobs a collector needs from the analysis policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSettings {
    pub query_text_limit: usize,
    pub timeout_ceiling_secs: f64,
    pub chains: ChainThresholds,
}

impl CollectorSettings {
    #[must_use]
    pub fn from_policy(policy: &AnalysisPolicy) -> Self {
        Self {
            query_text_limit: policy.collection.query_text_limit,
            timeout_ceiling_secs: policy.contention.timeout_ceiling_secs,
            chains: policy.wait_chain.clone(),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from_policy(&AnalysisPolicy::default())
    }
}

pub type BackendConstructor =
    fn(DbPool, DatabaseId, CollectorSettings) -> Result<Arc<dyn LockCollector>, AnalysisError>;

// Adding a backend: implement `LockCollector` plus `from_pool`, then list it here.
register_backends! {
    mysql => MySqlCollector,
    postgresql => PostgresCollector,
}

pub mod registry;
pub mod util;
