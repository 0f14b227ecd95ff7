use crate::collectors::CollectorSettings;
use crate::collectors::util::sql_text_limit;
use crate::model::{LockMode, LockSnapshot, LockType};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};
use tracing::info_span;
use tracing_futures::Instrument as _;

const LOCKS_QUERY: &str = r"
    SELECT
        dl.ENGINE_LOCK_ID AS lock_id,
        dl.LOCK_TYPE AS lock_type,
        dl.LOCK_MODE AS lock_mode,
        dl.LOCK_STATUS AS lock_status,
        dl.OBJECT_SCHEMA AS schema_name,
        dl.OBJECT_NAME AS object_name,
        dl.INDEX_NAME AS index_name,
        CAST(dl.ENGINE_TRANSACTION_ID AS CHAR) AS trx_id,
        t.trx_mysql_thread_id AS thread_id,
        LEFT(t.trx_query, ?) AS query,
        CASE WHEN dl.LOCK_STATUS = 'WAITING'
             THEN CAST(TIMESTAMPDIFF(MICROSECOND, t.trx_wait_started, NOW(6)) / 1000000 AS DOUBLE)
        END AS wait_seconds,
        (SELECT GROUP_CONCAT(DISTINCT CAST(w.BLOCKING_ENGINE_TRANSACTION_ID AS CHAR))
           FROM performance_schema.data_lock_waits w
          WHERE w.REQUESTING_ENGINE_LOCK_ID = dl.ENGINE_LOCK_ID) AS blocked_by
    FROM performance_schema.data_locks dl
    LEFT JOIN information_schema.innodb_trx t
           ON t.trx_id = dl.ENGINE_TRANSACTION_ID
    WHERE dl.OBJECT_SCHEMA = DATABASE()
    ORDER BY dl.LOCK_STATUS DESC, trx_id
";

/// One decoded `performance_schema.data_locks` row.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct MyLockRow {
    pub lock_id: String,
    pub lock_type: String,
    pub lock_mode: String,
    pub lock_status: String,
    pub schema_name: Option<String>,
    pub object_name: Option<String>,
    pub index_name: Option<String>,
    pub trx_id: String,
    pub thread_id: Option<u64>,
    pub query: Option<String>,
    pub wait_seconds: Option<f64>,
    pub blocked_by: Option<String>,
}

impl MyLockRow {
    fn decode(row: &MySqlRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            lock_id: row.try_get("lock_id")?,
            lock_type: row.try_get("lock_type")?,
            lock_mode: row.try_get::<Option<String>, _>("lock_mode")?.unwrap_or_default(),
            lock_status: row.try_get("lock_status")?,
            schema_name: row.try_get("schema_name")?,
            object_name: row.try_get("object_name")?,
            index_name: row.try_get("index_name")?,
            trx_id: row.try_get("trx_id")?,
            thread_id: row.try_get("thread_id")?,
            query: row.try_get("query")?,
            wait_seconds: row.try_get("wait_seconds")?,
            blocked_by: row.try_get("blocked_by")?,
        })
    }

    pub fn into_snapshot(self) -> LockSnapshot {
        let mode_detail = match &self.index_name {
            Some(index) => format!("{} ON {index}", self.lock_mode),
            None => self.lock_mode.clone(),
        };

        LockSnapshot {
            id: self.lock_id,
            lock_type: LockType::from_mysql(&self.lock_type),
            mode: LockMode::from_mysql(&self.lock_mode),
            mode_detail,
            process_id: self
                .thread_id
                .and_then(|t| i64::try_from(t).ok())
                .unwrap_or(0),
            session_id: self.trx_id,
            object_name: self.object_name.unwrap_or_else(|| "unknown".to_string()),
            object_type: "table".to_string(),
            schema_name: self.schema_name,
            granted: self.lock_status.eq_ignore_ascii_case("GRANTED"),
            query: self.query.filter(|q| !q.trim().is_empty()),
            wait_start: None,
            wait_duration: self.wait_seconds.map(|s| s.max(0.0)),
            blocked_by: self
                .blocked_by
                .as_deref()
                .map(|ids| {
                    ids.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

pub(super) async fn fetch(
    pool: &MySqlPool,
    settings: &CollectorSettings,
) -> Result<Vec<LockSnapshot>, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "mysql",
        db.operation = "SELECT",
        db.statement = "SELECT lock, trx, blockers FROM performance_schema.data_locks JOIN innodb_trx",
        db.sql.table = "data_locks"
    );

    let rows = sqlx::query(LOCKS_QUERY)
        .bind(sql_text_limit(settings.query_text_limit))
        .fetch_all(pool)
        .instrument(span)
        .await?;

    rows.iter()
        .map(|row| MyLockRow::decode(row).map(MyLockRow::into_snapshot))
        .collect()
}
