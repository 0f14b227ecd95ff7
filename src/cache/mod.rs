//! Two-tier read-through cache.
//!
//! Tier 1 is a bounded in-process LRU holding typed values. Tier 2 is an
//! optional [`SharedStore`] holding JSON. Lookups go local, then shared, then
//! origin; origin values are written to both tiers and shared hits are
//! promoted. A failing shared tier is logged and counted, never surfaced.
//!
//! Keys follow `lockscope:<category>:<database_id>:<name>`.

use crate::error::AnalysisError;
use crate::metrics::Metrics;
use crate::policy::CachePolicy;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub mod local;
pub mod shared;

pub use local::LocalCache;
pub use shared::{MemorySharedStore, PgSharedStore, SharedStore};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("shared cache backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<CacheError> for AnalysisError {
    fn from(err: CacheError) -> Self {
        Self::CacheUnavailable(err.to_string())
    }
}

/// Freshness class of a cached value; selects the shared-tier TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    Live,
    Analysis,
    Historical,
}

impl CacheCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Analysis => "analysis",
            Self::Historical => "historical",
        }
    }

    /// Analyses over windows of an hour or more are historical.
    #[must_use]
    pub fn for_window(window: Duration) -> Self {
        if window >= Duration::from_secs(3_600) {
            Self::Historical
        } else {
            Self::Analysis
        }
    }
}

#[must_use]
pub fn cache_key(category: CacheCategory, database_id: &str, name: &str) -> String {
    format!("lockscope:{}:{database_id}:{name}", category.as_str())
}

/// Pattern matching every key of one database.
#[must_use]
pub fn database_pattern(database_id: &str) -> String {
    format!("lockscope:*:{database_id}:*")
}

#[allow(clippy::expect_used)]
static GLOB_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\\*").expect("valid glob regex"));

/// Whether `key` matches `pattern`, where `*` matches any run of characters.
#[must_use]
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    let escaped = regex::escape(pattern);
    let anchored = format!("^{}$", GLOB_STAR.replace_all(&escaped, ".*"));
    Regex::new(&anchored).is_ok_and(|re| re.is_match(key))
}

/// Translate a `*` glob into a SQL `LIKE` pattern escaped with `\`.
#[must_use]
pub fn glob_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '\\' | '%' | '_' => {
                like.push('\\');
                like.push(c);
            }
            '*' => like.push('%'),
            _ => like.push(c),
        }
    }
    like
}

pub struct TieredCache {
    local: Mutex<LocalCache>,
    shared: Option<Arc<dyn SharedStore>>,
    policy: CachePolicy,
    metrics: Arc<Metrics>,
}

impl TieredCache {
    #[must_use]
    pub fn new(
        policy: CachePolicy,
        shared: Option<Arc<dyn SharedStore>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local: Mutex::new(LocalCache::new(policy.local_capacity)),
            shared,
            policy,
            metrics,
        }
    }

    /// Shared-tier TTL for `category`.
    #[must_use]
    pub const fn ttl(&self, category: CacheCategory) -> Duration {
        let secs = match category {
            CacheCategory::Live => self.policy.live_ttl_secs,
            CacheCategory::Analysis => self.policy.analysis_ttl_secs,
            CacheCategory::Historical => self.policy.historical_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    // A local copy never outlives the shared one.
    fn local_ttl(&self, category: CacheCategory) -> Duration {
        Duration::from_secs(self.policy.local_ttl_secs).min(self.ttl(category))
    }

    pub async fn get<T>(&self, key: &str, category: CacheCategory) -> Option<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let local = self.local.lock().get(key);
        if let Some(value) = local.and_then(|v| v.downcast::<T>().ok()) {
            self.metrics.cache_lookup("local", "hit");
            debug!(key, "local cache hit");
            return Some(value);
        }
        self.metrics.cache_lookup("local", "miss");

        let shared = self.shared.as_ref()?;
        let raw = match shared.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.metrics.cache_lookup("shared", "miss");
                return None;
            }
            Err(e) => {
                self.metrics.cache_lookup("shared", "error");
                warn!(key, store = shared.name(), error = %e, "shared cache read failed");
                return None;
            }
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                self.metrics.cache_lookup("shared", "hit");
                debug!(key, "shared cache hit, promoting");
                let value = Arc::new(value);
                self.local
                    .lock()
                    .insert(key, value.clone(), self.local_ttl(category));
                Some(value)
            }
            Err(e) => {
                self.metrics.cache_lookup("shared", "error");
                warn!(key, error = %e, "discarding undecodable shared cache entry");
                None
            }
        }
    }

    pub async fn put<T>(&self, key: &str, category: CacheCategory, value: Arc<T>)
    where
        T: Serialize + Send + Sync + 'static,
    {
        if let Some(shared) = &self.shared {
            match serde_json::to_string(value.as_ref()) {
                Ok(raw) => {
                    if let Err(e) = shared.set(key, raw, self.ttl(category)).await {
                        self.metrics.cache_lookup("shared", "error");
                        warn!(key, store = shared.name(), error = %e, "shared cache write failed");
                    }
                }
                Err(e) => warn!(key, error = %e, "value not serializable, skipping shared tier"),
            }
        }

        self.local.lock().insert(key, value, self.local_ttl(category));
    }

    /// Read-through: return the cached value or compute, store and return it.
    ///
    /// # Errors
    ///
    /// Propagates the error of `compute`; nothing is cached in that case.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        category: CacheCategory,
        compute: F,
    ) -> Result<Arc<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key, category).await {
            return Ok(hit);
        }

        let value = Arc::new(compute().await?);
        self.put(key, category, value.clone()).await;
        Ok(value)
    }

    /// Evict every key matching `pattern` from both tiers and return how many
    /// distinct keys went away.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let mut evicted: BTreeSet<String> = self
            .local
            .lock()
            .remove_matching(|k| glob_matches(pattern, k))
            .into_iter()
            .collect();

        if let Some(shared) = &self.shared {
            match shared.invalidate(pattern).await {
                Ok(keys) => evicted.extend(keys),
                Err(e) => {
                    self.metrics.cache_lookup("shared", "error");
                    warn!(pattern, store = shared.name(), error = %e, "shared cache invalidation failed");
                }
            }
        }

        debug!(pattern, evicted = evicted.len(), "cache invalidated");
        evicted.len()
    }

    #[must_use]
    pub fn local_len(&self) -> usize {
        self.local.lock().len()
    }
}
