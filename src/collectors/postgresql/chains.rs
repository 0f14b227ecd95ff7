use crate::analyzers::wait_chain::SessionNode;
use crate::collectors::CollectorSettings;
use crate::collectors::util::sql_text_limit;
use sqlx::{PgPool, Row};
use tracing::info_span;
use tracing_futures::Instrument as _;

// Every session waiting on a heavyweight lock, plus every session that
// blocks one of them. Edges come from pg_blocking_pids(); the graph itself
// is walked in process. Waits are timed from the oldest ungranted lock
// request, falling back to the last state change before PostgreSQL 14.
const SESSIONS_QUERY: &str = r"
    WITH blocked AS (
        SELECT
            a.pid,
            pg_blocking_pids(a.pid) AS blocked_by,
            COALESCE(
                (SELECT MIN(l.waitstart) FROM pg_locks l WHERE l.pid = a.pid AND NOT l.granted),
                a.state_change
            ) AS wait_since
        FROM pg_stat_activity a
        WHERE a.wait_event_type = 'Lock'
          AND a.pid <> pg_backend_pid()
    )
    SELECT
        a.pid,
        LEFT(a.query, $1) AS query,
        COALESCE(b.blocked_by, '{}'::int[]) AS blocked_by,
        CASE WHEN b.pid IS NULL THEN 0::float8
             ELSE EXTRACT(EPOCH FROM (clock_timestamp() - b.wait_since))::float8
        END AS wait_seconds
    FROM pg_stat_activity a
    LEFT JOIN blocked b ON b.pid = a.pid
    WHERE b.pid IS NOT NULL
       OR a.pid IN (SELECT unnest(blocked_by) FROM blocked)
    ORDER BY a.pid
";

/// One decoded session row.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct PgSessionRow {
    pub pid: i32,
    pub query: Option<String>,
    pub blocked_by: Option<Vec<i32>>,
    pub wait_seconds: Option<f64>,
}

impl PgSessionRow {
    pub fn into_node(self) -> SessionNode {
        SessionNode {
            session_id: self.pid.to_string(),
            process_id: i64::from(self.pid),
            query: self.query.filter(|q| !q.trim().is_empty()),
            wait_time: self.wait_seconds.unwrap_or(0.0).max(0.0),
            blocked_by: self
                .blocked_by
                .unwrap_or_default()
                .iter()
                .filter(|pid| **pid != self.pid)
                .map(ToString::to_string)
                .collect(),
        }
    }
}

pub(super) async fn fetch(
    pool: &PgPool,
    settings: &CollectorSettings,
) -> Result<Vec<SessionNode>, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = "SELECT pid, query, pg_blocking_pids(pid) FROM pg_stat_activity (lock waiters + blockers)",
        db.sql.table = "pg_stat_activity"
    );

    let rows = sqlx::query(SESSIONS_QUERY)
        .bind(sql_text_limit(settings.query_text_limit))
        .fetch_all(pool)
        .instrument(span)
        .await?;

    let mut sessions = Vec::with_capacity(rows.len());
    for row in &rows {
        let decoded = PgSessionRow {
            pid: row.try_get("pid")?,
            query: row.try_get("query")?,
            blocked_by: row.try_get("blocked_by")?,
            wait_seconds: row.try_get("wait_seconds")?,
        };
        sessions.push(decoded.into_node());
    }

    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_node() {
        let node = PgSessionRow {
            pid: 311,
            query: Some("UPDATE jobs SET state = 'done' WHERE id = 4".to_string()),
            blocked_by: Some(vec![290, 305]),
            wait_seconds: Some(7.25),
        }
        .into_node();

        assert_eq!(node.session_id, "311");
        assert_eq!(node.process_id, 311);
        assert_eq!(node.blocked_by, vec!["290".to_string(), "305".to_string()]);
        assert!((node.wait_time - 7.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_blocker_row_with_nulls() {
        let node = PgSessionRow {
            pid: 290,
            ..PgSessionRow::default()
        }
        .into_node();

        assert!(node.blocked_by.is_empty());
        assert!(node.query.is_none());
        assert!(node.wait_time.abs() < f64::EPSILON);
    }

    #[test]
    fn test_negative_wait_and_blank_query() {
        let node = PgSessionRow {
            pid: 12,
            query: Some("  ".to_string()),
            blocked_by: Some(vec![12, 13]),
            wait_seconds: Some(-1.5),
        }
        .into_node();

        assert!(node.query.is_none());
        assert!(node.wait_time.abs() < f64::EPSILON);
        assert_eq!(node.blocked_by, vec!["13".to_string()]);
    }
}
