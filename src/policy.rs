//! Tunable analysis policy.
//!
//! The defaults are the thresholds and weights the engine ships with. They
//! have not been calibrated against production workloads, so every value is
//! overridable from a JSON policy file (`--policy`). Missing keys fall back to
//! the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid policy: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisPolicy {
    pub wait_chain: ChainThresholds,
    pub contention: ContentionThresholds,
    pub health: HealthPolicy,
    pub collection: CollectionPolicy,
    pub cache: CachePolicy,
    pub pool: PoolPolicy,
}

impl AnalysisPolicy {
    /// Load a policy from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`AnalysisPolicy::validate`].
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: display.clone(),
            source,
        })?;

        let policy: Self = serde_json::from_str(&raw).map_err(|source| PolicyError::Parse {
            path: display,
            source,
        })?;

        policy.validate()?;

        Ok(policy)
    }

    /// Reject policies the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let w = &self.health.weights;
        let weights = [
            w.wait_time,
            w.contention,
            w.deadlock,
            w.blocking_chain,
            w.timeout,
        ];

        if weights.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(PolicyError::Invalid(
                "health weights must be finite and non-negative".to_string(),
            ));
        }

        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(PolicyError::Invalid(
                "health weights must not all be zero".to_string(),
            ));
        }

        let c = &self.collection;
        if c.locks_timeout_ms == 0 || c.wait_chains_timeout_ms == 0 || c.statistics_timeout_ms == 0
        {
            return Err(PolicyError::Invalid(
                "collection timeouts must be positive".to_string(),
            ));
        }

        if self.cache.local_capacity == 0 {
            return Err(PolicyError::Invalid(
                "cache.local_capacity must be at least 1".to_string(),
            ));
        }

        if self.pool.max_connections == 0 || self.pool.min_connections > self.pool.max_connections
        {
            return Err(PolicyError::Invalid(
                "pool sizes must satisfy 0 <= min_connections <= max_connections, max > 0"
                    .to_string(),
            ));
        }

        let t = &self.contention;
        if t.hot_spot_min_events == 0 || t.impact_wait_ceiling_secs <= 0.0 {
            return Err(PolicyError::Invalid(
                "contention.hot_spot_min_events and impact_wait_ceiling_secs must be positive"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Fixed severity thresholds for wait chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainThresholds {
    pub high_wait_secs: f64,
    pub high_length: usize,
    pub medium_wait_secs: f64,
    pub medium_length: usize,
}

impl Default for ChainThresholds {
    fn default() -> Self {
        Self {
            high_wait_secs: 60.0,
            high_length: 5,
            medium_wait_secs: 10.0,
            medium_length: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentionThresholds {
    pub hot_spot_min_events: u64,
    pub hot_spot_window_secs: f64,
    pub burst_min_events: u64,
    pub burst_interval_secs: f64,
    pub frequent_min_windows: u32,
    /// Lock wait ceiling after which the backend (or the application) gives up.
    pub timeout_ceiling_secs: f64,
    /// A wait counts as "near the ceiling" at this fraction of it.
    pub timeout_near_ratio: f64,
    /// Share of near-ceiling waits that makes an object timeout prone.
    pub timeout_prone_share: f64,
    /// Total wait at which the wait half of the impact score saturates.
    pub impact_wait_ceiling_secs: f64,
    pub critical_impact: f64,
    pub high_impact: f64,
    pub medium_impact: f64,
}

impl Default for ContentionThresholds {
    fn default() -> Self {
        Self {
            hot_spot_min_events: 20,
            hot_spot_window_secs: 60.0,
            burst_min_events: 5,
            burst_interval_secs: 10.0,
            frequent_min_windows: 3,
            timeout_ceiling_secs: 30.0,
            timeout_near_ratio: 0.8,
            timeout_prone_share: 0.5,
            impact_wait_ceiling_secs: 300.0,
            critical_impact: 80.0,
            high_impact: 60.0,
            medium_impact: 30.0,
        }
    }
}

/// Relative weight of each health sub-score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub wait_time: f64,
    pub contention: f64,
    pub deadlock: f64,
    pub blocking_chain: f64,
    pub timeout: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            wait_time: 0.30,
            contention: 0.25,
            deadlock: 0.20,
            blocking_chain: 0.15,
            timeout: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub weights: HealthWeights,
    pub avg_wait_threshold_secs: f64,
    pub total_wait_threshold_secs: f64,
    pub deadlock_penalty: f64,
    pub timeout_penalty: f64,
    /// Penalty per contention entry, indexed low, medium, high, critical.
    pub contention_penalties: [f64; 4],
    /// Penalty per wait chain, indexed low, medium, high, critical.
    pub chain_penalties: [f64; 4],
    /// Extra penalty per chain node beyond the first two.
    pub chain_depth_penalty: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            weights: HealthWeights::default(),
            avg_wait_threshold_secs: 5.0,
            total_wait_threshold_secs: 300.0,
            deadlock_penalty: 20.0,
            timeout_penalty: 10.0,
            contention_penalties: [3.0, 8.0, 15.0, 25.0],
            chain_penalties: [5.0, 10.0, 20.0, 30.0],
            chain_depth_penalty: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionPolicy {
    pub locks_timeout_ms: u64,
    pub wait_chains_timeout_ms: u64,
    pub statistics_timeout_ms: u64,
    /// Query text longer than this is cut when captured.
    pub query_text_limit: usize,
    /// Width of the blocking query shown in summaries.
    pub display_query_chars: usize,
}

impl Default for CollectionPolicy {
    fn default() -> Self {
        Self {
            locks_timeout_ms: 5_000,
            wait_chains_timeout_ms: 5_000,
            statistics_timeout_ms: 5_000,
            query_text_limit: 2_048,
            display_query_chars: 120,
        }
    }
}

impl CollectionPolicy {
    #[must_use]
    pub const fn locks_timeout(&self) -> Duration {
        Duration::from_millis(self.locks_timeout_ms)
    }

    #[must_use]
    pub const fn wait_chains_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_chains_timeout_ms)
    }

    #[must_use]
    pub const fn statistics_timeout(&self) -> Duration {
        Duration::from_millis(self.statistics_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub local_capacity: usize,
    pub local_ttl_secs: u64,
    pub live_ttl_secs: u64,
    pub analysis_ttl_secs: u64,
    pub historical_ttl_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            local_capacity: 256,
            local_ttl_secs: 30,
            live_ttl_secs: 5,
            analysis_ttl_secs: 300,
            historical_ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolPolicy {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub max_lifetime_secs: u64,
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 4,
            acquire_timeout_ms: 5_000,
            max_lifetime_secs: 120,
            connect_retries: 3,
            connect_backoff_ms: 200,
            probe_timeout_ms: 2_000,
        }
    }
}
