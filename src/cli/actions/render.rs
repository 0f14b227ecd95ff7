use crate::model::{AnalysisResult, Completeness, HealthReport, truncate_for_display};
use std::fmt::Write as _;

const QUERY_CHARS: usize = 80;

fn sub_score(label: &str, value: Option<f64>) -> String {
    value.map_or_else(|| format!("{label} n/a"), |v| format!("{label} {v:.1}"))
}

fn count(value: Option<u64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

fn health_line(health: &HealthReport) -> String {
    [
        sub_score("wait", health.wait_time),
        sub_score("contention", health.contention),
        sub_score("deadlock", health.deadlock),
        sub_score("chains", health.blocking_chain),
        sub_score("timeout", health.timeout),
    ]
    .join(", ")
}

/// Human readable report of one analysis.
#[must_use]
pub fn text(result: &AnalysisResult) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "{} ({}) window {}s, analysis {} at {}",
        result.database_id,
        result.backend,
        result.window_secs,
        result.analysis_id,
        result.analyzed_at.to_rfc3339(),
    );
    let _ = writeln!(
        out,
        "health {:.1} [{}]  {}",
        result.health_score,
        result.health.status.as_str(),
        health_line(&result.health)
    );

    if let Some(stats) = &result.statistics {
        let _ = writeln!(
            out,
            "locks {} total, {} waiting; deadlocks {}, timeouts {}; wait avg {:.2}s max {:.2}s",
            stats.total_locks,
            stats.waiting_locks,
            count(stats.deadlock_count),
            count(stats.timeout_count),
            stats.avg_wait_time,
            stats.max_wait_time,
        );
    }

    if !result.wait_chains.is_empty() {
        let _ = writeln!(
            out,
            "\nwait chains ({}, {} deadlocked)",
            result.wait_chains.len(),
            result.deadlock_chains().count()
        );
        for chain in &result.wait_chains {
            let _ = writeln!(
                out,
                "  [{}] {} -> {} length {}, waited {:.1}s{}",
                chain.severity,
                chain.head_session,
                chain.tail_session,
                chain.chain_length,
                chain.total_wait_time,
                if chain.is_cycle { ", DEADLOCK" } else { "" },
            );
            if let Some(query) = chain.blocking_query(QUERY_CHARS) {
                let _ = writeln!(out, "      blocker: {query}");
            }
        }
    }

    if !result.contentions.is_empty() {
        let _ = writeln!(out, "\ncontention ({})", result.contentions.len());
        for c in &result.contentions {
            let _ = writeln!(
                out,
                "  [{}] {} {} waits, avg {:.2}s, max {:.2}s, {} impact {:.0}",
                c.priority,
                c.qualified_name(),
                c.contention_count,
                c.avg_wait_time,
                c.max_wait_time,
                c.pattern.as_str(),
                c.performance_impact,
            );
        }
    }

    if !result.advice.is_empty() {
        let _ = writeln!(out, "\nadvice ({})", result.advice.len());
        for (n, advice) in result.advice.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {}. [{}] {} ({}, impact {:.0}): {}",
                n + 1,
                advice.priority,
                advice.title,
                advice.advice_type.as_str(),
                advice.impact_score,
                advice.estimated_improvement,
            );
            for step in &advice.steps {
                let _ = writeln!(out, "     - {}", step.description);
                if let Some(sql) = &step.statement {
                    let _ = writeln!(out, "       {}", truncate_for_display(sql, 2 * QUERY_CHARS));
                }
            }
        }
    }

    if let Completeness::Partial { gaps } = result.completeness() {
        let _ = writeln!(out, "\npartial result, missing:");
        for gap in gaps {
            let _ = writeln!(out, "  {gap}");
        }
    }

    out
}
