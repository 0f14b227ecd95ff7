use crate::model::{AnalysisResult, OptimizationAdvice};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

#[macro_use]
mod register_macro;

/// Turns one facet of an analysis result into remediation advice.
///
/// Implementations are pure: the same result always yields the same advice
/// in the same order.
pub trait Strategy {
    fn name(&self) -> &'static str;

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn generate(&self, result: &AnalysisResult) -> Vec<OptimizationAdvice>;
}

// New strategies only need a module and a line here.
register_strategies! {
    index => IndexStrategy,
    query => QueryStrategy,
    deadlock => DeadlockStrategy,
    lock_timeout => LockTimeoutStrategy,
}

pub mod config;
pub mod registry;

/// Order advice by priority, then impact (both descending), then id, and
/// drop repeated ids keeping the highest ranked one.
#[must_use]
pub fn rank_advice(mut advice: Vec<OptimizationAdvice>) -> Vec<OptimizationAdvice> {
    advice.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.impact_score.total_cmp(&a.impact_score))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut seen = HashSet::new();
    advice.retain(|a| seen.insert(a.id.clone()));
    advice
}

#[allow(clippy::expect_used)]
static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid string literal regex"));

#[allow(clippy::expect_used)]
static NUMBER_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b-?\d+(?:\.\d+)?\b|\$\d+").expect("valid number literal regex")
});

#[allow(clippy::expect_used)]
static IN_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bin\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").expect("valid in-list regex"));

/// Normalized query shape: literals and bind markers become `?`, `IN` lists
/// collapse, whitespace and case are folded.
#[must_use]
pub fn fingerprint(query: &str) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let no_strings = STRING_LITERAL.replace_all(&collapsed, "?");
    let no_numbers = NUMBER_LITERAL.replace_all(&no_strings, "?");
    let no_lists = IN_LIST.replace_all(&no_numbers, "in (?)");
    no_lists
        .trim()
        .trim_end_matches(';')
        .trim_end()
        .to_lowercase()
}

/// Short stable identifier for free text (64-bit FNV-1a, hex).
#[must_use]
pub fn stable_id(text: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    format!("{hash:016x}")
}

/// Quote one identifier for `backend`: backticks for MySQL, double quotes
/// otherwise, with embedded quote characters doubled.
#[must_use]
pub fn quote_ident(backend: &str, ident: &str) -> String {
    let quote = if backend == "mysql" { '`' } else { '"' };
    let mut out = String::with_capacity(ident.len() + 2);
    out.push(quote);
    for c in ident.chars() {
        if c == quote {
            out.push(quote);
        }
        out.push(c);
    }
    out.push(quote);
    out
}

/// `schema.name` with both parts quoted; the schema is omitted when unknown.
#[must_use]
pub fn quote_qualified(backend: &str, schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => {
            format!("{}.{}", quote_ident(backend, schema), quote_ident(backend, name))
        }
        _ => quote_ident(backend, name),
    }
}

/// Impact on a 0-100 scale from accumulated wait seconds, saturating at
/// five minutes.
#[must_use]
pub fn wait_impact(total_wait_secs: f64) -> f64 {
    (100.0 * (1.0 + total_wait_secs.max(0.0)).ln() / 301.0_f64.ln()).clamp(0.0, 100.0)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::model::{
        AnalysisResult, ChainNode, ContentionMetrics, ContentionPattern, HealthReport,
        HealthStatus, LockStatistics, Severity, WaitChain,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    pub fn result(backend: &str) -> AnalysisResult {
        AnalysisResult {
            analysis_id: "a1".to_string(),
            database_id: "orders@db:5432".to_string(),
            backend: backend.to_string(),
            window_secs: 300.0,
            analyzed_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            health_score: 70.0,
            health: HealthReport {
                overall: 70.0,
                status: HealthStatus::Fair,
                wait_time: Some(70.0),
                contention: Some(70.0),
                deadlock: Some(70.0),
                blocking_chain: Some(70.0),
                timeout: Some(70.0),
            },
            statistics: Some(LockStatistics::default()),
            wait_chains: Vec::new(),
            contentions: Vec::new(),
            advice: Vec::new(),
            gaps: Vec::new(),
            diagnostics: BTreeMap::new(),
        }
    }

    pub fn contention(name: &str, pattern: ContentionPattern, queries: &[&str]) -> ContentionMetrics {
        ContentionMetrics {
            object_name: name.to_string(),
            object_type: "table".to_string(),
            schema_name: Some("public".to_string()),
            contention_count: 25,
            total_wait_time: 500.0,
            avg_wait_time: 20.0,
            max_wait_time: 20.0,
            pattern,
            affected_sessions: 25,
            affected_queries: queries.len(),
            performance_impact: 100.0,
            priority: Severity::Critical,
            sample_queries: queries.iter().map(|q| (*q).to_string()).collect(),
        }
    }

    pub fn chain(id: &str, sessions: &[(&str, &str)], is_cycle: bool, severity: Severity) -> WaitChain {
        let nodes: Vec<ChainNode> = sessions
            .iter()
            .enumerate()
            .map(|(depth, (session, query))| ChainNode {
                session_id: (*session).to_string(),
                process_id: session.parse().unwrap_or(0),
                query: Some((*query).to_string()),
                depth,
                wait_time: 12.0,
            })
            .collect();

        WaitChain {
            id: id.to_string(),
            chain_length: nodes.len(),
            total_wait_time: 12.0 * nodes.len() as f64,
            head_session: nodes.first().map(|n| n.session_id.clone()).unwrap_or_default(),
            tail_session: nodes.last().map(|n| n.session_id.clone()).unwrap_or_default(),
            nodes,
            is_cycle,
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AdviceType, Severity};

    fn advice(id: &str, priority: Severity, impact: f64) -> OptimizationAdvice {
        OptimizationAdvice {
            id: id.to_string(),
            advice_type: AdviceType::Query,
            priority,
            title: id.to_string(),
            description: String::new(),
            target_object: None,
            impact_score: impact,
            estimated_improvement: String::new(),
            steps: Vec::new(),
        }
    }

    #[test]
    fn test_rank_advice() {
        let ranked = rank_advice(vec![
            advice("b", Severity::High, 50.0),
            advice("a", Severity::High, 50.0),
            advice("c", Severity::Critical, 10.0),
            advice("d", Severity::High, 90.0),
            advice("a", Severity::Low, 1.0),
        ]);

        let ids: Vec<&str> = ranked.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a", "b"]);
        assert_eq!(ranked[2].priority, Severity::High);
    }

    #[test]
    fn test_fingerprint() {
        assert_eq!(
            fingerprint("UPDATE  accounts SET balance = balance - 10.5\n WHERE id = 42;"),
            "update accounts set balance = balance - ? where id = ?"
        );
        assert_eq!(
            fingerprint("SELECT * FROM t WHERE name = 'O''Brien' AND id IN (1, 2, 3)"),
            "select * from t where name = ? and id in (?)"
        );
        assert_eq!(
            fingerprint("DELETE FROM jobs WHERE id = $1"),
            "delete from jobs where id = ?"
        );
    }

    #[test]
    fn test_stable_id() {
        assert_eq!(stable_id("abc"), stable_id("abc"));
        assert_ne!(stable_id("abc"), stable_id("abd"));
        assert_eq!(stable_id("").len(), 16);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("postgresql", "OrderItems"), "\"OrderItems\"");
        assert_eq!(quote_ident("postgresql", "we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident("mysql", "order"), "`order`");
        assert_eq!(quote_ident("mysql", "a`b"), "`a``b`");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(
            quote_qualified("postgresql", Some("Sales"), "orders"),
            "\"Sales\".\"orders\""
        );
        assert_eq!(quote_qualified("mysql", Some(""), "orders"), "`orders`");
        assert_eq!(quote_qualified("mysql", None, "orders"), "`orders`");
    }

    #[test]
    fn test_wait_impact() {
        assert!(wait_impact(0.0).abs() < f64::EPSILON);
        assert!((wait_impact(300.0) - 100.0).abs() < 1e-9);
        assert!((wait_impact(10_000.0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_strategies_registered() {
        let factories = all_strategies();
        for name in STRATEGY_NAMES {
            let strategy = factories.get(name).map(|f| f());
            assert_eq!(strategy.map(|s| s.name()), Some(*name));
        }
    }
}
