//! Self-monitoring for the analysis engine.
//!
//! Metrics live in a registry owned by the [`Metrics`] value rather than the
//! process-global default registry, so several orchestrators (and tests) can
//! coexist.
//!
//! | metric | type | labels |
//! |--------|------|--------|
//! | `lockscope_analysis_duration_seconds` | histogram | `backend`, `outcome` |
//! | `lockscope_collection_errors_total` | counter | `call`, `kind` |
//! | `lockscope_cache_lookups_total` | counter | `tier`, `outcome` |
//! | `lockscope_single_flight_joins_total` | counter | |
//! | `lockscope_health_score` | gauge | `database` |

use anyhow::Result;
use prometheus::{Encoder, GaugeVec, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    analysis_duration_seconds: HistogramVec,
    collection_errors_total: IntCounterVec,
    cache_lookups_total: IntCounterVec,
    single_flight_joins_total: IntCounter,
    health_score: GaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// # Panics
    ///
    /// Panics if metric creation or registration fails, which only happens
    /// with invalid metric names.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let analysis_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "lockscope_analysis_duration_seconds",
                "Wall time of one comprehensive analysis",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["backend", "outcome"],
        )
        .expect("lockscope_analysis_duration_seconds");

        let collection_errors_total = IntCounterVec::new(
            Opts::new(
                "lockscope_collection_errors_total",
                "Failed collection calls by call and failure kind",
            ),
            &["call", "kind"],
        )
        .expect("lockscope_collection_errors_total");

        let cache_lookups_total = IntCounterVec::new(
            Opts::new(
                "lockscope_cache_lookups_total",
                "Cache lookups by tier and outcome (hit, miss, error)",
            ),
            &["tier", "outcome"],
        )
        .expect("lockscope_cache_lookups_total");

        let single_flight_joins_total = IntCounter::with_opts(Opts::new(
            "lockscope_single_flight_joins_total",
            "Analyses served by joining one already in flight",
        ))
        .expect("lockscope_single_flight_joins_total");

        let health_score = GaugeVec::new(
            Opts::new("lockscope_health_score", "Latest lock health score (0-100)"),
            &["database"],
        )
        .expect("lockscope_health_score");

        let registry = Registry::new();
        registry
            .register(Box::new(analysis_duration_seconds.clone()))
            .expect("register lockscope_analysis_duration_seconds");
        registry
            .register(Box::new(collection_errors_total.clone()))
            .expect("register lockscope_collection_errors_total");
        registry
            .register(Box::new(cache_lookups_total.clone()))
            .expect("register lockscope_cache_lookups_total");
        registry
            .register(Box::new(single_flight_joins_total.clone()))
            .expect("register lockscope_single_flight_joins_total");
        registry
            .register(Box::new(health_score.clone()))
            .expect("register lockscope_health_score");

        Self {
            registry,
            analysis_duration_seconds,
            collection_errors_total,
            cache_lookups_total,
            single_flight_joins_total,
            health_score,
        }
    }

    pub fn observe_analysis(&self, backend: &str, outcome: &str, seconds: f64) {
        self.analysis_duration_seconds
            .with_label_values(&[backend, outcome])
            .observe(seconds);
    }

    pub fn collection_error(&self, call: &str, kind: &str) {
        self.collection_errors_total
            .with_label_values(&[call, kind])
            .inc();
    }

    pub fn cache_lookup(&self, tier: &str, outcome: &str) {
        self.cache_lookups_total
            .with_label_values(&[tier, outcome])
            .inc();
    }

    pub fn single_flight_join(&self) {
        self.single_flight_joins_total.inc();
    }

    pub fn set_health_score(&self, database: &str, score: f64) {
        self.health_score.with_label_values(&[database]).set(score);
    }

    #[must_use]
    pub fn cache_lookups(&self, tier: &str, outcome: &str) -> u64 {
        self.cache_lookups_total
            .with_label_values(&[tier, outcome])
            .get()
    }

    #[must_use]
    pub fn single_flight_joins(&self) -> u64 {
        self.single_flight_joins_total.get()
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
