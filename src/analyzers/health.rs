use crate::error::AnalysisError;
use crate::model::{
    ContentionMetrics, HealthReport, HealthStatus, LockStatistics, Severity, WaitChain,
};
use crate::policy::HealthPolicy;

/// Whatever analysis output survived; `None` means the input is missing,
/// not empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs<'a> {
    pub statistics: Option<&'a LockStatistics>,
    pub contentions: Option<&'a [ContentionMetrics]>,
    pub wait_chains: Option<&'a [WaitChain]>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthScorer {
    policy: HealthPolicy,
}

const fn severity_index(s: Severity) -> usize {
    match s {
        Severity::Low => 0,
        Severity::Medium => 1,
        Severity::High => 2,
        Severity::Critical => 3,
    }
}

fn floor_score(penalty: f64) -> f64 {
    (100.0 - penalty).clamp(0.0, 100.0)
}

#[must_use]
pub fn status_for(score: f64) -> HealthStatus {
    if score >= 90.0 {
        HealthStatus::Excellent
    } else if score >= 75.0 {
        HealthStatus::Good
    } else if score >= 50.0 {
        HealthStatus::Fair
    } else if score >= 25.0 {
        HealthStatus::Poor
    } else {
        HealthStatus::Critical
    }
}

impl HealthScorer {
    #[must_use]
    pub const fn new(policy: HealthPolicy) -> Self {
        Self { policy }
    }

    /// Combine the available sub-scores into one report. Weights of missing
    /// sub-scores are dropped and the rest renormalized.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::AnalyzerFailure`] when no input at all is
    /// available.
    pub fn score(&self, inputs: &HealthInputs<'_>) -> Result<HealthReport, AnalysisError> {
        let p = &self.policy;
        let w = &p.weights;

        let wait_time = inputs.statistics.map(|s| self.wait_time_score(s));
        let contention = inputs.contentions.map(|c| self.contention_score(c));
        let deadlock = self.deadlock_score(inputs.statistics, inputs.wait_chains);
        let blocking_chain = inputs.wait_chains.map(|c| self.chain_score(c));
        let timeout = inputs
            .statistics
            .and_then(|s| s.timeout_count)
            .map(|count| floor_score(p.timeout_penalty * crate::u64_to_f64(count)));

        let parts = [
            (wait_time, w.wait_time),
            (contention, w.contention),
            (deadlock, w.deadlock),
            (blocking_chain, w.blocking_chain),
            (timeout, w.timeout),
        ];

        let present: Vec<(f64, f64)> = parts
            .iter()
            .filter_map(|(score, weight)| score.map(|s| (s, *weight)))
            .collect();

        if present.is_empty() {
            return Err(AnalysisError::AnalyzerFailure {
                analyzer: "health".to_string(),
                cause: "no statistics, contention or wait-chain input available".to_string(),
            });
        }

        let weight_sum: f64 = present.iter().map(|(_, w)| w).sum();
        let overall = if weight_sum > 0.0 {
            present.iter().map(|(s, w)| s * w).sum::<f64>() / weight_sum
        } else {
            present.iter().map(|(s, _)| s).sum::<f64>() / crate::u64_to_f64(present.len() as u64)
        }
        .clamp(0.0, 100.0);

        Ok(HealthReport {
            overall,
            status: status_for(overall),
            wait_time,
            contention,
            deadlock,
            blocking_chain,
            timeout,
        })
    }

    fn wait_time_score(&self, stats: &LockStatistics) -> f64 {
        let p = &self.policy;
        let avg = (stats.avg_wait_time.max(0.0) / p.avg_wait_threshold_secs).min(1.0);
        let total = (stats.total_wait_time.max(0.0) / p.total_wait_threshold_secs).min(1.0);
        (100.0 * (1.0 - 0.5 * avg - 0.5 * total)).clamp(0.0, 100.0)
    }

    fn contention_score(&self, contentions: &[ContentionMetrics]) -> f64 {
        let penalties = &self.policy.contention_penalties;
        let penalty: f64 = contentions
            .iter()
            .map(|c| penalties.get(severity_index(c.priority)).copied().unwrap_or(0.0))
            .sum();
        floor_score(penalty)
    }

    // Counter-based deadlocks and live cycles can disagree (first sample,
    // not-yet-resolved deadlock); the larger one wins.
    fn deadlock_score(
        &self,
        stats: Option<&LockStatistics>,
        chains: Option<&[WaitChain]>,
    ) -> Option<f64> {
        let counted = stats.and_then(|s| s.deadlock_count);
        let observed = chains.map(|c| c.iter().filter(|chain| chain.is_cycle).count() as u64);

        let deadlocks = match (counted, observed) {
            (None, None) => return None,
            (a, b) => a.unwrap_or(0).max(b.unwrap_or(0)),
        };

        Some(floor_score(
            self.policy.deadlock_penalty * crate::u64_to_f64(deadlocks),
        ))
    }

    fn chain_score(&self, chains: &[WaitChain]) -> f64 {
        let p = &self.policy;
        let penalty: f64 = chains
            .iter()
            .map(|c| {
                let base = p
                    .chain_penalties
                    .get(severity_index(c.severity))
                    .copied()
                    .unwrap_or(0.0);
                let extra = c.chain_length.saturating_sub(2) as u64;
                base + p.chain_depth_penalty * crate::u64_to_f64(extra)
            })
            .sum();
        floor_score(penalty)
    }
}
