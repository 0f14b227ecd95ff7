use crate::model::{ActionStep, AdviceType, AnalysisResult, OptimizationAdvice, Severity};
use crate::strategies::{Strategy, fingerprint};
use std::collections::BTreeSet;

#[derive(Clone, Debug, Default)]
pub struct DeadlockStrategy;

impl DeadlockStrategy {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Strategy for DeadlockStrategy {
    fn name(&self) -> &'static str {
        "deadlock"
    }

    fn generate(&self, result: &AnalysisResult) -> Vec<OptimizationAdvice> {
        let cycles: Vec<_> = result.deadlock_chains().collect();
        let counted = result
            .statistics
            .as_ref()
            .and_then(|s| s.deadlock_count)
            .unwrap_or(0);

        if cycles.is_empty() && counted == 0 {
            return Vec::new();
        }

        let fingerprints: BTreeSet<String> = cycles
            .iter()
            .flat_map(|c| c.nodes.iter())
            .filter_map(|n| n.query.as_deref())
            .map(fingerprint)
            .collect();

        let deadlocks = counted.max(cycles.len() as u64);
        let (priority, impact) = if cycles.is_empty() {
            (Severity::High, 60.0)
        } else {
            (Severity::Critical, (60.0 + 20.0 * crate::u64_to_f64(deadlocks)).min(100.0))
        };

        let mut steps: Vec<ActionStep> = fingerprints
            .iter()
            .map(|fp| ActionStep::note(format!("Involved statement: {fp}")))
            .collect();

        steps.push(ActionStep::note(
            "Acquire row and table locks in one global order (for example ascending primary key) in every code path",
        ));

        if result.backend == "mysql" {
            steps.push(ActionStep::note(
                "Retry transactions that fail with error 1213 (ER_LOCK_DEADLOCK) using jittered backoff",
            ));
            steps.push(ActionStep::sql(
                "Log every deadlock to the error log for post-mortem analysis",
                "SET GLOBAL innodb_print_all_deadlocks = ON;",
                Some("SET GLOBAL innodb_print_all_deadlocks = OFF;".to_string()),
            ));
        } else {
            steps.push(ActionStep::note(
                "Retry transactions that fail with SQLSTATE 40P01 (deadlock_detected) using jittered backoff",
            ));
            steps.push(ActionStep::sql(
                "Log lock waits longer than deadlock_timeout for post-mortem analysis",
                "ALTER SYSTEM SET log_lock_waits = on; SELECT pg_reload_conf();",
                Some("ALTER SYSTEM RESET log_lock_waits; SELECT pg_reload_conf();".to_string()),
            ));
        }

        vec![OptimizationAdvice {
            id: format!("deadlock:{}", result.database_id),
            advice_type: AdviceType::Deadlock,
            priority,
            title: "Eliminate lock-order deadlocks".to_string(),
            description: format!(
                "{deadlocks} deadlock(s) in the window, {} currently visible as wait cycles.",
                cycles.len()
            ),
            target_object: None,
            impact_score: impact,
            estimated_improvement: "Transactions stop being aborted by deadlock detection".to_string(),
            steps,
        }]
    }
}
