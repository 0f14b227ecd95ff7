use crate::model::{
    ActionStep, AdviceType, AnalysisResult, ContentionPattern, OptimizationAdvice, Severity,
};
use crate::strategies::Strategy;

/// Lock wait bound suggested to sessions that currently queue behind hot
/// objects.
const SUGGESTED_TIMEOUT_SECS: u64 = 5;
/// InnoDB's compiled-in default, used for rollback when the server did not
/// report its setting.
const MYSQL_DEFAULT_WAIT_TIMEOUT: &str = "50";

#[derive(Clone, Debug, Default)]
pub struct LockTimeoutStrategy;

impl LockTimeoutStrategy {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Strategy for LockTimeoutStrategy {
    fn name(&self) -> &'static str {
        "lock_timeout"
    }

    fn generate(&self, result: &AnalysisResult) -> Vec<OptimizationAdvice> {
        let prone: Vec<String> = result
            .contentions
            .iter()
            .filter(|c| c.pattern == ContentionPattern::TimeoutProne)
            .map(crate::model::ContentionMetrics::qualified_name)
            .collect();
        let timeouts = result
            .statistics
            .as_ref()
            .and_then(|s| s.timeout_count)
            .unwrap_or(0);

        if prone.is_empty() && timeouts == 0 {
            return Vec::new();
        }

        let priority = if timeouts > 0 {
            Severity::High
        } else {
            Severity::Medium
        };

        let set = if result.backend == "mysql" {
            let previous = result
                .diagnostics
                .get("lock_wait_timeout")
                .map_or(MYSQL_DEFAULT_WAIT_TIMEOUT, String::as_str);
            ActionStep::sql(
                "Bound InnoDB row lock waits",
                format!("SET GLOBAL innodb_lock_wait_timeout = {SUGGESTED_TIMEOUT_SECS};"),
                Some(format!("SET GLOBAL innodb_lock_wait_timeout = {previous};")),
            )
        } else {
            ActionStep::sql(
                "Bound lock waits for the application role",
                format!("ALTER ROLE CURRENT_USER SET lock_timeout = '{SUGGESTED_TIMEOUT_SECS}s';"),
                Some("ALTER ROLE CURRENT_USER RESET lock_timeout;".to_string()),
            )
        };

        let description = if prone.is_empty() {
            format!("{timeouts} lock wait(s) hit the timeout ceiling in the window.")
        } else {
            format!(
                "{timeouts} lock wait(s) hit the timeout ceiling; waits on {} cluster near it.",
                prone.join(", ")
            )
        };

        vec![OptimizationAdvice {
            id: format!("lock_timeout:{}", result.database_id),
            advice_type: AdviceType::Configuration,
            priority,
            title: format!("Fail lock waits after {SUGGESTED_TIMEOUT_SECS}s instead of queueing"),
            description,
            target_object: prone.first().cloned(),
            impact_score: (40.0 + 10.0 * crate::u64_to_f64(timeouts) + 5.0 * crate::u64_to_f64(prone.len() as u64))
                .min(100.0),
            estimated_improvement: "Waiters fail fast and retry instead of piling up behind one holder".to_string(),
            steps: vec![
                set,
                ActionStep::note("Make sure the application retries statements that fail on lock timeout"),
            ],
        }]
    }
}
