//! Coordinates one comprehensive analysis:
//!
//! 1. acquire the collector for the database,
//! 2. run the three collection calls concurrently, each under its own
//!    deadline,
//! 3. run wait-chain and contention analysis concurrently, then score health,
//! 4. run every enabled strategy over the partial result and rank the advice,
//! 5. assemble, write through the cache and hand the result to the sink.
//!
//! A failed collection call degrades the result (recorded in `gaps`) instead
//! of failing it; only losing all three calls is a hard error.

use crate::analyzers::{
    ContentionAnalyzer, ContentionHistory, HealthInputs, HealthScorer, WaitChainAnalyzer,
};
use crate::cache::{CacheCategory, SharedStore, TieredCache, cache_key, database_pattern};
use crate::collectors::LockCollector;
use crate::error::{AnalysisError, CollectionCall, CollectionError, CollectionErrorKind};
use crate::metrics::Metrics;
use crate::model::{
    AnalysisResult, ContentionMetrics, DataGap, LockSnapshot, LockStatistics, WaitChain,
};
use crate::policy::AnalysisPolicy;
use crate::pool::DatabaseId;
use crate::strategies::registry::StrategySet;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

pub mod provider;
pub mod single_flight;
pub mod sink;

pub use provider::{CollectorProvider, PooledCollectorProvider};
pub use single_flight::{FlightRole, SingleFlight};
pub use sink::{JsonLinesSink, ReportSink};

pub struct OrchestratorBuilder {
    provider: Arc<dyn CollectorProvider>,
    policy: AnalysisPolicy,
    strategies: StrategySet,
    shared_cache: Option<Arc<dyn SharedStore>>,
    sink: Option<Arc<dyn ReportSink>>,
    metrics: Option<Arc<Metrics>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn strategies(mut self, strategies: StrategySet) -> Self {
        self.strategies = strategies;
        self
    }

    #[must_use]
    pub fn shared_cache(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared_cache = Some(store);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn build(self) -> Orchestrator {
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(Metrics::new()));
        let policy = self.policy;

        Orchestrator {
            inner: Arc::new(Inner {
                provider: self.provider,
                cache: TieredCache::new(policy.cache.clone(), self.shared_cache, Arc::clone(&metrics)),
                strategies: self.strategies,
                chains: WaitChainAnalyzer::new(policy.wait_chain.clone()),
                contention: ContentionAnalyzer::new(policy.contention.clone()),
                scorer: HealthScorer::new(policy.health.clone()),
                histories: Mutex::new(HashMap::new()),
                flights: SingleFlight::new(),
                sink: self.sink,
                metrics,
                policy,
            }),
        }
    }
}

/// Entry point of the engine. Cheap to clone; clones share pools, caches and
/// in-flight analyses.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn CollectorProvider>,
    policy: AnalysisPolicy,
    cache: TieredCache,
    strategies: StrategySet,
    chains: WaitChainAnalyzer,
    contention: ContentionAnalyzer,
    scorer: HealthScorer,
    histories: Mutex<HashMap<DatabaseId, ContentionHistory>>,
    flights: SingleFlight<Arc<AnalysisResult>>,
    sink: Option<Arc<dyn ReportSink>>,
    metrics: Arc<Metrics>,
}

fn analysis_key(database_id: &DatabaseId, window: Duration) -> String {
    cache_key(
        CacheCategory::for_window(window),
        database_id.as_str(),
        &format!("window:{}", window.as_secs()),
    )
}

impl Orchestrator {
    pub fn builder(
        provider: Arc<dyn CollectorProvider>,
        policy: AnalysisPolicy,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            provider,
            policy,
            strategies: StrategySet::all(),
            shared_cache: None,
            sink: None,
            metrics: None,
        }
    }

    /// Analyze `database_id` over the trailing `window`.
    ///
    /// Served from cache when a complete result for the same window is still
    /// fresh. Concurrent calls for one database share a single run.
    ///
    /// # Errors
    ///
    /// Fails when the collector cannot be acquired, when all three collection
    /// calls fail, or when no health input survives.
    #[instrument(skip(self), level = "info", err, fields(database = %database_id, window_secs = window.as_secs(), otel.kind = "internal"))]
    pub async fn analyze_comprehensive(
        &self,
        database_id: &DatabaseId,
        window: Duration,
    ) -> Result<Arc<AnalysisResult>, AnalysisError> {
        let key = analysis_key(database_id, window);
        if let Some(hit) = self
            .inner
            .cache
            .get::<AnalysisResult>(&key, CacheCategory::for_window(window))
            .await
        {
            debug!(database = %database_id, "analysis served from cache");
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let id = database_id.clone();
        let (result, role) = self
            .inner
            .flights
            .run(database_id, window, move || async move {
                inner.run_pipeline(&id, window).await
            })
            .await;

        if role == FlightRole::Follower {
            self.inner.metrics.single_flight_join();
        }

        result
    }

    /// Current lock snapshot, cached in the `live` category.
    ///
    /// # Errors
    ///
    /// Fails when the collector cannot be acquired or the lock query fails.
    #[instrument(skip(self), level = "info", err, fields(database = %database_id, otel.kind = "internal"))]
    pub async fn current_locks(
        &self,
        database_id: &DatabaseId,
    ) -> Result<Arc<Vec<LockSnapshot>>, AnalysisError> {
        let key = cache_key(CacheCategory::Live, database_id.as_str(), "locks");

        self.inner
            .cache
            .get_or_compute(&key, CacheCategory::Live, || async {
                let collector = self.inner.provider.acquire(database_id).await?;
                let deadline = self.inner.policy.collection.locks_timeout();

                match timeout(deadline, collector.collect_current_locks()).await {
                    Ok(Ok(locks)) => Ok(locks),
                    Ok(Err(e)) => {
                        self.inner.record_collection_error(&e);
                        Err(AnalysisError::Collection(e))
                    }
                    Err(_) => {
                        let e = CollectionError::timeout(CollectionCall::Locks, deadline);
                        self.inner.record_collection_error(&e);
                        Err(AnalysisError::CollectionTimeout {
                            database_id: database_id.to_string(),
                            calls: CollectionCall::Locks.to_string(),
                        })
                    }
                }
            })
            .await
    }

    /// Drop every cached entry of `database_id`, then analyze afresh.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::analyze_comprehensive`].
    pub async fn refresh(
        &self,
        database_id: &DatabaseId,
        window: Duration,
    ) -> Result<Arc<AnalysisResult>, AnalysisError> {
        let evicted = self
            .cache_invalidate(&database_pattern(database_id.as_str()))
            .await;
        debug!(database = %database_id, evicted, "cache cleared for refresh");
        self.analyze_comprehensive(database_id, window).await
    }

    /// Evict cache keys matching a `*` glob; returns the number evicted.
    pub async fn cache_invalidate(&self, pattern: &str) -> usize {
        self.inner.cache.invalidate(pattern).await
    }

    /// Whether the database answers; never errors.
    pub async fn health_check(&self, database_id: &DatabaseId) -> bool {
        match self.inner.provider.acquire(database_id).await {
            Ok(collector) => collector.health_check().await,
            Err(e) => {
                warn!(database = %database_id, error = %e, "health check could not acquire a collector");
                false
            }
        }
    }

    /// Close every pool. Call once before exiting.
    pub async fn shutdown(&self) {
        self.inner.provider.close_all().await;
        info!("orchestrator shut down");
    }

    /// Contention history recorded so far for `database_id`.
    #[must_use]
    pub fn contention_history(&self, database_id: &DatabaseId) -> ContentionHistory {
        self.inner
            .histories
            .lock()
            .get(database_id)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    #[must_use]
    pub fn policy(&self) -> &AnalysisPolicy {
        &self.inner.policy
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.inner.strategies.names()
    }
}

/// Outcome of the three collection calls plus server metadata.
struct Collected {
    locks: Result<Vec<LockSnapshot>, CollectionError>,
    chains: Result<Vec<WaitChain>, CollectionError>,
    statistics: Result<LockStatistics, CollectionError>,
    diagnostics: BTreeMap<String, String>,
}

impl Collected {
    fn errors(&self) -> Vec<&CollectionError> {
        [
            self.locks.as_ref().err(),
            self.chains.as_ref().err(),
            self.statistics.as_ref().err(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn all_failed(&self) -> bool {
        self.errors().len() == 3
    }

    // Only meaningful when every call failed.
    fn into_error(self, database_id: &DatabaseId) -> AnalysisError {
        let errors = self.errors();

        if errors.iter().all(|e| e.is_timeout()) {
            let calls: Vec<&str> = errors.iter().map(|e| e.call.as_str()).collect();
            return AnalysisError::CollectionTimeout {
                database_id: database_id.to_string(),
                calls: calls.join(", "),
            };
        }

        errors
            .into_iter()
            .find(|e| !e.is_timeout())
            .cloned()
            .map_or_else(
                || AnalysisError::Internal("collection failed without an error".to_string()),
                AnalysisError::Collection,
            )
    }
}

fn spawn_call<T, F>(
    call: CollectionCall,
    deadline: Duration,
    fut: F,
) -> JoinHandle<Result<T, CollectionError>>
where
    T: Send + 'static,
    F: Future<Output = Result<T, CollectionError>> + Send + 'static,
{
    tokio::spawn(async move {
        timeout(deadline, fut)
            .await
            .unwrap_or_else(|_| Err(CollectionError::timeout(call, deadline)))
    })
}

async fn join_call<T>(
    call: CollectionCall,
    handle: JoinHandle<Result<T, CollectionError>>,
) -> Result<T, CollectionError> {
    handle.await.unwrap_or_else(|e| {
        Err(CollectionError::new(
            CollectionErrorKind::Query,
            call,
            format!("collection task failed: {e}"),
        ))
    })
}

async fn join_analyzer<T>(task: Option<JoinHandle<T>>) -> Option<Result<T, JoinError>> {
    match task {
        Some(task) => Some(task.await),
        None => None,
    }
}

fn settle<T>(
    analyzer: &str,
    outcome: Option<Result<T, JoinError>>,
    gaps: &mut Vec<DataGap>,
) -> Option<T> {
    match outcome? {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(analyzer, error = %e, "analyzer failed");
            gaps.push(DataGap::Analyzer {
                name: analyzer.to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}

impl Inner {
    fn record_collection_error(&self, e: &CollectionError) {
        self.metrics
            .collection_error(e.call.as_str(), &e.kind.to_string());
    }

    async fn run_pipeline(
        &self,
        database_id: &DatabaseId,
        window: Duration,
    ) -> Result<Arc<AnalysisResult>, AnalysisError> {
        let started = Instant::now();

        let collector = self.provider.acquire(database_id).await?;
        let backend = collector.backend();

        let collected = self.collect(&collector, window).await;

        let mut gaps = Vec::new();
        for e in collected.errors() {
            warn!(database = %database_id, call = %e.call, kind = %e.kind, error = %e.cause, "collection call failed");
            self.record_collection_error(e);
            gaps.push(DataGap::Source {
                call: e.call,
                reason: e.to_string(),
            });
        }

        if collected.all_failed() {
            self.metrics
                .observe_analysis(backend, "failed", started.elapsed().as_secs_f64());
            return Err(collected.into_error(database_id));
        }

        let now = Utc::now();
        let Collected {
            locks,
            chains,
            statistics,
            diagnostics,
        } = collected;
        let statistics = statistics.ok();

        let (wait_chains, contentions) = self
            .analyze(database_id, locks.ok(), chains.ok(), now, &mut gaps)
            .await;

        let health = match self.scorer.score(&HealthInputs {
            statistics: statistics.as_ref(),
            contentions: contentions.as_deref(),
            wait_chains: wait_chains.as_deref(),
        }) {
            Ok(health) => health,
            Err(e) => {
                self.metrics
                    .observe_analysis(backend, "failed", started.elapsed().as_secs_f64());
                return Err(e);
            }
        };

        let partial = Arc::new(AnalysisResult {
            analysis_id: ulid::Ulid::new().to_string(),
            database_id: database_id.to_string(),
            backend: backend.to_string(),
            window_secs: window.as_secs_f64(),
            analyzed_at: now,
            health_score: health.overall,
            health,
            statistics,
            wait_chains: wait_chains.unwrap_or_default(),
            contentions: contentions.unwrap_or_default(),
            advice: Vec::new(),
            gaps,
            diagnostics,
        });

        let (advice, strategy_gaps) = self.strategies.generate_all(Arc::clone(&partial)).await;
        let mut result = Arc::unwrap_or_clone(partial);
        result.advice = advice;
        result.gaps.extend(strategy_gaps);
        let result = Arc::new(result);

        let outcome = if result.is_complete() { "full" } else { "partial" };
        self.metrics
            .observe_analysis(backend, outcome, started.elapsed().as_secs_f64());
        self.metrics
            .set_health_score(database_id.as_str(), result.health_score);

        if result.is_complete() {
            self.cache
                .put(
                    &analysis_key(database_id, window),
                    CacheCategory::for_window(window),
                    Arc::clone(&result),
                )
                .await;
        } else {
            debug!(database = %database_id, gaps = result.gaps.len(), "partial result not cached");
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.store(&result).await {
                warn!(sink = sink.name(), error = %e, "failed to persist analysis");
            }
        }

        info!(
            database = %database_id,
            health = result.health_score,
            chains = result.wait_chains.len(),
            deadlocks = result.deadlock_chains().count(),
            contentions = result.contentions.len(),
            advice = result.advice.len(),
            outcome,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "analysis complete"
        );

        Ok(result)
    }

    async fn collect(&self, collector: &Arc<dyn LockCollector>, window: Duration) -> Collected {
        let c = &self.policy.collection;

        let locks = {
            let collector = Arc::clone(collector);
            spawn_call(CollectionCall::Locks, c.locks_timeout(), async move {
                collector.collect_current_locks().await
            })
        };
        let chains = {
            let collector = Arc::clone(collector);
            spawn_call(CollectionCall::WaitChains, c.wait_chains_timeout(), async move {
                collector.collect_wait_chains().await
            })
        };
        let statistics = {
            let collector = Arc::clone(collector);
            spawn_call(CollectionCall::Statistics, c.statistics_timeout(), async move {
                collector.collect_statistics(window).await
            })
        };

        let (locks, chains, statistics, diagnostics) = tokio::join!(
            join_call(CollectionCall::Locks, locks),
            join_call(CollectionCall::WaitChains, chains),
            join_call(CollectionCall::Statistics, statistics),
            timeout(c.statistics_timeout(), collector.diagnostics()),
        );

        Collected {
            locks,
            chains,
            statistics,
            diagnostics: diagnostics.unwrap_or_default(),
        }
    }

    async fn analyze(
        &self,
        database_id: &DatabaseId,
        locks: Option<Vec<LockSnapshot>>,
        chains: Option<Vec<WaitChain>>,
        now: DateTime<Utc>,
        gaps: &mut Vec<DataGap>,
    ) -> (Option<Vec<WaitChain>>, Option<Vec<ContentionMetrics>>) {
        let locks = locks.map(Arc::new);

        let chain_task = {
            let analyzer = self.chains.clone();
            match (chains, &locks) {
                (Some(chains), _) => Some(tokio::task::spawn_blocking(move || analyzer.analyze(chains))),
                (None, Some(locks)) => {
                    debug!(database = %database_id, "rebuilding wait chains from lock snapshot");
                    let locks = Arc::clone(locks);
                    Some(tokio::task::spawn_blocking(move || analyzer.from_locks(&locks, now)))
                }
                (None, None) => None,
            }
        };

        let contention_task = locks.map(|locks| {
            let analyzer = self.contention.clone();
            let history = self
                .histories
                .lock()
                .get(database_id)
                .cloned()
                .unwrap_or_default();
            tokio::task::spawn_blocking(move || analyzer.analyze(&locks, &history, now))
        });

        let (chains, contentions) =
            tokio::join!(join_analyzer(chain_task), join_analyzer(contention_task));

        let chains = settle("wait_chain", chains, gaps);
        let contentions = settle("contention", contentions, gaps);

        if let Some(found) = &contentions {
            self.histories
                .lock()
                .entry(database_id.clone())
                .or_default()
                .record(found);
        }

        (chains, contentions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(call: CollectionCall) -> CollectionError {
        CollectionError::new(CollectionErrorKind::Query, call, "relation does not exist")
    }

    fn timed_out(call: CollectionCall) -> CollectionError {
        CollectionError::timeout(call, Duration::from_secs(5))
    }

    #[test]
    fn test_all_timeouts_is_collection_timeout() {
        let collected = Collected {
            locks: Err(timed_out(CollectionCall::Locks)),
            chains: Err(timed_out(CollectionCall::WaitChains)),
            statistics: Err(timed_out(CollectionCall::Statistics)),
            diagnostics: BTreeMap::new(),
        };

        assert!(collected.all_failed());
        match collected.into_error(&DatabaseId::from("orders")) {
            AnalysisError::CollectionTimeout { database_id, calls } => {
                assert_eq!(database_id, "orders");
                assert_eq!(calls, "locks, wait_chains, statistics");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mixed_failures_report_first_non_timeout() {
        let collected = Collected {
            locks: Err(timed_out(CollectionCall::Locks)),
            chains: Err(failed(CollectionCall::WaitChains)),
            statistics: Err(failed(CollectionCall::Statistics)),
            diagnostics: BTreeMap::new(),
        };

        match collected.into_error(&DatabaseId::from("orders")) {
            AnalysisError::Collection(e) => assert_eq!(e.call, CollectionCall::WaitChains),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_single_failure_is_not_fatal() {
        let collected = Collected {
            locks: Ok(Vec::new()),
            chains: Err(failed(CollectionCall::WaitChains)),
            statistics: Ok(LockStatistics::default()),
            diagnostics: BTreeMap::new(),
        };

        assert!(!collected.all_failed());
        assert_eq!(collected.errors().len(), 1);
    }

    #[test]
    fn test_analysis_key_category_follows_window() {
        let id = DatabaseId::from("orders");
        assert_eq!(
            analysis_key(&id, Duration::from_secs(300)),
            "lockscope:analysis:orders:window:300"
        );
        assert_eq!(
            analysis_key(&id, Duration::from_secs(7200)),
            "lockscope:historical:orders:window:7200"
        );
    }

    #[tokio::test]
    async fn test_panicking_analyzer_becomes_gap() {
        let mut gaps = Vec::new();
        let task = tokio::task::spawn_blocking(|| -> Vec<WaitChain> { panic!("boom") });
        let settled = settle("wait_chain", join_analyzer(Some(task)).await, &mut gaps);

        assert!(settled.is_none());
        assert!(matches!(&gaps[..], [DataGap::Analyzer { name, .. }] if name == "wait_chain"));
    }
}
