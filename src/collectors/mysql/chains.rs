use crate::analyzers::wait_chain::SessionNode;
use crate::collectors::CollectorSettings;
use crate::collectors::util::sql_text_limit;
use sqlx::{MySqlPool, Row};
use std::collections::BTreeMap;
use tracing::info_span;
use tracing_futures::Instrument as _;

// One row per (transaction, blocking transaction) pair; transactions that
// wait on nothing come back once with a NULL blocker.
const TRX_QUERY: &str = r"
    SELECT
        CAST(r.trx_id AS CHAR) AS session_id,
        r.trx_mysql_thread_id AS thread_id,
        LEFT(r.trx_query, ?) AS query,
        CASE WHEN r.trx_state = 'LOCK WAIT'
             THEN CAST(TIMESTAMPDIFF(MICROSECOND, r.trx_wait_started, NOW(6)) / 1000000 AS DOUBLE)
             ELSE 0e0
        END AS wait_seconds,
        CAST(w.BLOCKING_ENGINE_TRANSACTION_ID AS CHAR) AS blocking_id
    FROM information_schema.innodb_trx r
    LEFT JOIN performance_schema.data_lock_waits w
           ON w.REQUESTING_ENGINE_TRANSACTION_ID = r.trx_id
    ORDER BY session_id
";

#[derive(Debug, Clone, PartialEq)]
pub(super) struct TrxWaitRow {
    pub session_id: String,
    pub thread_id: Option<u64>,
    pub query: Option<String>,
    pub wait_seconds: Option<f64>,
    pub blocking_id: Option<String>,
}

/// Merge the per-edge rows into one node per transaction.
pub(super) fn fold_sessions(rows: Vec<TrxWaitRow>) -> Vec<SessionNode> {
    let mut sessions: BTreeMap<String, SessionNode> = BTreeMap::new();

    for row in rows {
        let node = sessions.entry(row.session_id.clone()).or_insert_with(|| {
            let pid = row.thread_id.and_then(|t| i64::try_from(t).ok()).unwrap_or(0);
            SessionNode::new(row.session_id.clone(), pid)
        });

        node.wait_time = node.wait_time.max(row.wait_seconds.unwrap_or(0.0));
        if node.query.is_none() {
            node.query = row.query.filter(|q| !q.trim().is_empty());
        }
        if let Some(blocker) = row.blocking_id {
            if !node.blocked_by.contains(&blocker) {
                node.blocked_by.push(blocker);
            }
        }
    }

    sessions.into_values().collect()
}

pub(super) async fn fetch(
    pool: &MySqlPool,
    settings: &CollectorSettings,
) -> Result<Vec<SessionNode>, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "mysql",
        db.operation = "SELECT",
        db.statement = "SELECT trx, blocking trx FROM innodb_trx LEFT JOIN data_lock_waits",
        db.sql.table = "innodb_trx"
    );

    let rows = sqlx::query(TRX_QUERY)
        .bind(sql_text_limit(settings.query_text_limit))
        .fetch_all(pool)
        .instrument(span)
        .await?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        decoded.push(TrxWaitRow {
            session_id: row.try_get("session_id")?,
            thread_id: row.try_get("thread_id")?,
            query: row.try_get("query")?,
            wait_seconds: row.try_get("wait_seconds")?,
            blocking_id: row.try_get("blocking_id")?,
        });
    }

    Ok(fold_sessions(decoded))
}
