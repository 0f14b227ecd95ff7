use crate::model::{
    ActionStep, AdviceType, AnalysisResult, OptimizationAdvice, Severity, WaitChain,
    truncate_for_display,
};
use crate::strategies::{Strategy, fingerprint, stable_id, wait_impact};
use std::collections::BTreeMap;

const DISPLAY_CHARS: usize = 120;

/// Flags statements that sit at the root of blocking chains and suggests
/// ways to hold their locks for less time.
#[derive(Clone, Debug, Default)]
pub struct QueryStrategy;

impl QueryStrategy {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

struct Blocker<'a> {
    sample: &'a str,
    chains: usize,
    blocked_sessions: usize,
    total_wait: f64,
    priority: Severity,
}

fn root_query(chain: &WaitChain) -> Option<&str> {
    chain
        .nodes
        .last()
        .and_then(|n| n.query.as_deref())
        .filter(|q| !q.trim().is_empty())
}

impl Strategy for QueryStrategy {
    fn name(&self) -> &'static str {
        "query"
    }

    fn generate(&self, result: &AnalysisResult) -> Vec<OptimizationAdvice> {
        let mut blockers: BTreeMap<String, Blocker<'_>> = BTreeMap::new();

        for chain in result
            .wait_chains
            .iter()
            .filter(|c| !c.is_cycle && c.severity >= Severity::Medium)
        {
            let Some(query) = root_query(chain) else {
                continue;
            };

            let entry = blockers.entry(fingerprint(query)).or_insert(Blocker {
                sample: query,
                chains: 0,
                blocked_sessions: 0,
                total_wait: 0.0,
                priority: chain.severity,
            });
            entry.chains += 1;
            entry.blocked_sessions += chain.chain_length.saturating_sub(1);
            entry.total_wait += chain.total_wait_time;
            entry.priority = entry.priority.max(chain.severity);
        }

        blockers
            .into_iter()
            .map(|(fp, b)| {
                let shown = truncate_for_display(b.sample, DISPLAY_CHARS);
                OptimizationAdvice {
                    id: format!("query:{}", stable_id(&fp)),
                    advice_type: AdviceType::Query,
                    priority: b.priority,
                    title: "Shorten lock hold time of a blocking statement".to_string(),
                    description: format!(
                        "`{shown}` heads {} blocking chain(s), holding up {} session(s) for {:.1}s in total.",
                        b.chains, b.blocked_sessions, b.total_wait
                    ),
                    target_object: None,
                    impact_score: wait_impact(b.total_wait),
                    estimated_improvement: "Blocked sessions proceed as soon as the statement's transaction commits".to_string(),
                    steps: vec![
                        ActionStep::note(format!("Fingerprint: {fp}")),
                        ActionStep::note("Split large updates or deletes into batches of bounded size, committing between batches"),
                        ActionStep::note("Keep the transaction short: move application work and remote calls outside it"),
                        ActionStep::note("Touch hot rows last in the transaction so their locks are held briefly"),
                    ],
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::{chain, result};

    #[test]
    fn test_groups_by_fingerprint() {
        let mut r = result("postgresql");
        r.wait_chains = vec![
            chain("c1", &[("1", "UPDATE a"), ("2", "DELETE FROM jobs WHERE id = 1")], false, Severity::High),
            chain("c2", &[("3", "UPDATE a"), ("4", "DELETE FROM jobs WHERE id = 2")], false, Severity::Medium),
            chain("c3", &[("5", "UPDATE a"), ("6", "VACUUM FULL x")], false, Severity::Low),
        ];

        let advice = QueryStrategy::new().generate(&r);

        assert_eq!(advice.len(), 1);
        let a = &advice[0];
        assert_eq!(a.priority, Severity::High);
        assert_eq!(a.id, format!("query:{}", stable_id("delete from jobs where id = ?")));
        assert!(a.description.contains("heads 2 blocking chain(s)"));
    }

    #[test]
    fn test_cycles_left_to_deadlock_strategy() {
        let mut r = result("postgresql");
        r.wait_chains = vec![chain(
            "cycle:1,2",
            &[("1", "UPDATE a"), ("2", "UPDATE b")],
            true,
            Severity::Critical,
        )];
        assert!(QueryStrategy::new().generate(&r).is_empty());
    }

    #[test]
    fn test_deterministic() {
        let mut r = result("mysql");
        r.wait_chains = vec![
            chain("c1", &[("1", "x"), ("2", "UPDATE t SET v = 1")], false, Severity::High),
            chain("c2", &[("3", "x"), ("4", "UPDATE u SET v = 1")], false, Severity::High),
        ];
        let strategy = QueryStrategy::new();
        assert_eq!(strategy.generate(&r), strategy.generate(&r));
    }
}
