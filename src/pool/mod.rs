//! Connection pools keyed by target database identity.
//!
//! One [`PoolManager`] is constructed at startup and shared by `Arc`. Each
//! identity maps to a `tokio::sync::OnceCell`, so concurrent first requests
//! for the same database join a single in-flight connect instead of racing
//! to build duplicate pools. The map itself sits behind a `parking_lot`
//! mutex that is never held across an await.

use crate::error::AnalysisError;
use crate::policy::PoolPolicy;
use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

mod factory;
mod target;

pub use factory::{DbPool, SqlxPoolFactory};
pub use target::{DatabaseId, TargetConfig};

/// Opens, probes and closes pools of one concrete type.
pub trait PoolFactory: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;

    fn connect<'a>(&'a self, target: &'a TargetConfig) -> BoxFuture<'a, Result<Self::Pool>>;

    /// Lightweight liveness query. Must not error; unreachable means `false`.
    fn probe<'a>(&'a self, pool: &'a Self::Pool) -> BoxFuture<'a, bool>;

    fn close<'a>(&'a self, pool: &'a Self::Pool) -> BoxFuture<'a, ()>;
}

type PoolSlot<P> = Arc<OnceCell<P>>;

pub struct PoolManager<F: PoolFactory> {
    factory: F,
    policy: PoolPolicy,
    pools: Mutex<HashMap<DatabaseId, PoolSlot<F::Pool>>>,
}

impl<F: PoolFactory> PoolManager<F> {
    pub fn new(factory: F, policy: PoolPolicy) -> Self {
        Self {
            factory,
            policy,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Return the pool for `target`, creating it on first use.
    ///
    /// A cached pool is probed before it is handed out; a pool that fails the
    /// probe is closed and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::Connectivity`] when every connect attempt
    /// failed.
    #[instrument(skip(self, target), level = "debug", err, fields(database = %target.id))]
    pub async fn get_or_create(&self, target: &TargetConfig) -> Result<F::Pool, AnalysisError> {
        loop {
            let slot = self.slot(&target.id);

            if let Some(pool) = slot.get() {
                if self.factory.probe(pool).await {
                    debug!(database = %target.id, "reusing pool");
                    return Ok(pool.clone());
                }

                warn!(database = %target.id, "pool failed health probe, recreating");
                if self.evict_slot(&target.id, &slot) {
                    self.factory.close(pool).await;
                }
                continue;
            }

            let pool = slot
                .get_or_try_init(|| self.connect_with_retry(target))
                .await?;

            return Ok(pool.clone());
        }
    }

    /// Close and forget the pool for `id`. Returns whether one existed.
    pub async fn close(&self, id: &DatabaseId) -> bool {
        let slot = self.pools.lock().remove(id);

        match slot.as_ref().and_then(|s| s.get()) {
            Some(pool) => {
                self.factory.close(pool).await;
                info!(database = %id, "pool closed");
                true
            }
            None => false,
        }
    }

    /// Close every pool. Call during shutdown.
    pub async fn close_all(&self) {
        let slots: Vec<(DatabaseId, PoolSlot<F::Pool>)> = self.pools.lock().drain().collect();

        for (id, slot) in slots {
            if let Some(pool) = slot.get() {
                self.factory.close(pool).await;
                debug!(database = %id, "pool closed");
            }
        }

        info!("all pools closed");
    }

    /// Number of identities with an established pool.
    pub fn len(&self) -> usize {
        self.pools
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &DatabaseId) -> PoolSlot<F::Pool> {
        self.pools.lock().entry(id.clone()).or_default().clone()
    }

    // Remove `slot` only if it is still the registered one; a concurrent
    // caller may already have replaced it.
    fn evict_slot(&self, id: &DatabaseId, slot: &PoolSlot<F::Pool>) -> bool {
        let mut pools = self.pools.lock();
        if pools.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            pools.remove(id);
            true
        } else {
            false
        }
    }

    async fn connect_with_retry(&self, target: &TargetConfig) -> Result<F::Pool, AnalysisError> {
        let attempts = self.policy.connect_retries.saturating_add(1);
        let mut backoff = Duration::from_millis(self.policy.connect_backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.factory.connect(target).await {
                Ok(pool) => {
                    info!(database = %target.id, backend = %target.backend, attempt, "pool created");
                    return Ok(pool);
                }
                Err(e) => {
                    warn!(database = %target.id, attempt, error = %e, "connect failed");
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(AnalysisError::Connectivity {
            database_id: target.id.to_string(),
            attempts,
            cause: last_error,
        })
    }
}
