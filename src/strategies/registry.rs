use crate::model::{AnalysisResult, DataGap, OptimizationAdvice};
use crate::strategies::config::StrategyConfig;
use crate::strategies::{Strategy, StrategyType, all_strategies, rank_advice};
use std::sync::Arc;
use tracing::{debug, warn};

/// The strategies enabled for an orchestrator, in name order.
#[derive(Clone, Debug)]
pub struct StrategySet {
    strategies: Vec<StrategyType>,
}

impl StrategySet {
    #[must_use]
    pub fn new(config: &StrategyConfig) -> Self {
        let factories = all_strategies();
        let mut names: Vec<&str> = config
            .enabled_strategies
            .iter()
            .map(String::as_str)
            .collect();
        names.sort_unstable();

        let strategies = names
            .into_iter()
            .filter_map(|name| {
                let strategy = factories.get(name).map(|f| f());
                if strategy.is_none() {
                    warn!(strategy = name, "unknown strategy ignored");
                }
                strategy
            })
            .collect();

        Self { strategies }
    }

    #[must_use]
    pub fn all() -> Self {
        Self::new(&StrategyConfig::defaults())
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(Strategy::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StrategyType> {
        self.strategies.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Run every strategy on its own blocking task and merge the ranked
    /// advice. A strategy that panics is reported as a gap; the others still
    /// contribute.
    pub async fn generate_all(
        &self,
        result: Arc<AnalysisResult>,
    ) -> (Vec<OptimizationAdvice>, Vec<DataGap>) {
        let handles: Vec<_> = self
            .strategies
            .iter()
            .cloned()
            .map(|strategy| {
                let result = Arc::clone(&result);
                let name = strategy.name();
                (name, tokio::task::spawn_blocking(move || strategy.generate(&result)))
            })
            .collect();

        let mut advice = Vec::new();
        let mut gaps = Vec::new();

        for (name, handle) in handles {
            match handle.await {
                Ok(generated) => {
                    debug!(strategy = name, count = generated.len(), "advice generated");
                    advice.extend(generated);
                }
                Err(e) => {
                    warn!(strategy = name, error = %e, "strategy failed");
                    gaps.push(DataGap::Strategy {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        (rank_advice(advice), gaps)
    }
}
