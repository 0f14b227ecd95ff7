use crate::collectors::CollectorSettings;
use crate::collectors::util::sql_text_limit;
use crate::model::{LockMode, LockSnapshot, LockType};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info_span;
use tracing_futures::Instrument as _;

// Row-lock waits surface as `transactionid` waits without a relation; they
// are attributed to the table the waiter itself has locked (tuple lock
// first), else to a table its blockers write to.
const LOCKS_QUERY: &str = r"
    WITH db AS (SELECT oid FROM pg_database WHERE datname = current_database())
    SELECT
        l.locktype,
        l.mode,
        l.granted,
        l.pid,
        c.relname AS relation_name,
        c.relkind::text AS relkind,
        n.nspname AS schema_name,
        own.relname AS waiter_table,
        own.nspname AS waiter_schema,
        blk.relname AS blocker_table,
        blk.nspname AS blocker_schema,
        LEFT(a.query, $1) AS query,
        l.waitstart,
        CASE WHEN l.granted THEN NULL
             ELSE EXTRACT(EPOCH FROM (clock_timestamp() - COALESCE(l.waitstart, a.state_change)))::float8
        END AS wait_seconds,
        CASE WHEN l.granted THEN '{}'::int[]
             ELSE pg_blocking_pids(l.pid)
        END AS blocked_by
    FROM pg_locks l
    LEFT JOIN pg_class c ON c.oid = l.relation
    LEFT JOIN pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_stat_activity a ON a.pid = l.pid
    LEFT JOIN LATERAL (
        SELECT rc.relname, rn.nspname
        FROM pg_locks rl
        JOIN pg_class rc ON rc.oid = rl.relation AND rc.relkind IN ('r', 'p')
        JOIN pg_namespace rn ON rn.oid = rc.relnamespace
        WHERE l.relation IS NULL
          AND NOT l.granted
          AND rl.pid = l.pid
          AND rl.database = (SELECT oid FROM db)
        ORDER BY (rl.locktype = 'tuple') DESC, rc.relname
        LIMIT 1
    ) own ON true
    LEFT JOIN LATERAL (
        SELECT rc.relname, rn.nspname
        FROM pg_locks rl
        JOIN pg_class rc ON rc.oid = rl.relation AND rc.relkind IN ('r', 'p')
        JOIN pg_namespace rn ON rn.oid = rc.relnamespace
        WHERE l.relation IS NULL
          AND NOT l.granted
          AND own.relname IS NULL
          AND rl.pid = ANY(pg_blocking_pids(l.pid))
          AND rl.mode IN ('RowExclusiveLock', 'RowShareLock')
          AND rl.database = (SELECT oid FROM db)
        ORDER BY rc.relname
        LIMIT 1
    ) blk ON true
    WHERE l.pid IS NOT NULL
      AND l.pid <> pg_backend_pid()
      AND (l.database IS NULL OR l.database = (SELECT oid FROM db))
    ORDER BY l.granted, l.pid
";

fn relkind_label(relkind: &str) -> Option<&'static str> {
    match relkind {
        "r" | "p" => Some("table"),
        "i" | "I" => Some("index"),
        "S" => Some("sequence"),
        "m" => Some("materialized_view"),
        "v" => Some("view"),
        _ => None,
    }
}

/// One decoded `pg_locks` row.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct PgLockRow {
    pub locktype: String,
    pub mode: String,
    pub granted: bool,
    pub pid: i32,
    pub relation_name: Option<String>,
    pub relkind: Option<String>,
    pub schema_name: Option<String>,
    pub waiter_table: Option<String>,
    pub waiter_schema: Option<String>,
    pub blocker_table: Option<String>,
    pub blocker_schema: Option<String>,
    pub query: Option<String>,
    pub waitstart: Option<DateTime<Utc>>,
    pub wait_seconds: Option<f64>,
    pub blocked_by: Vec<i32>,
}

/// Object a lock row is reported against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct LockedObject {
    pub name: String,
    pub object_type: String,
    pub schema: Option<String>,
}

impl PgLockRow {
    fn decode(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            locktype: row.try_get("locktype")?,
            mode: row.try_get("mode")?,
            granted: row.try_get("granted")?,
            pid: row.try_get("pid")?,
            relation_name: row.try_get("relation_name")?,
            relkind: row.try_get("relkind")?,
            schema_name: row.try_get("schema_name")?,
            waiter_table: row.try_get("waiter_table")?,
            waiter_schema: row.try_get("waiter_schema")?,
            blocker_table: row.try_get("blocker_table")?,
            blocker_schema: row.try_get("blocker_schema")?,
            query: row.try_get("query")?,
            waitstart: row.try_get("waitstart")?,
            wait_seconds: row.try_get("wait_seconds")?,
            blocked_by: row.try_get::<Option<Vec<i32>>, _>("blocked_by")?.unwrap_or_default(),
        })
    }

    /// The locked relation, else the table a row-lock wait was attributed
    /// to, else the bare lock type.
    pub fn object(&self) -> LockedObject {
        if let Some(name) = &self.relation_name {
            return LockedObject {
                name: name.clone(),
                object_type: self
                    .relkind
                    .as_deref()
                    .and_then(relkind_label)
                    .unwrap_or(self.locktype.as_str())
                    .to_string(),
                schema: self.schema_name.clone(),
            };
        }

        let attributed = self
            .waiter_table
            .as_ref()
            .map(|t| (t, &self.waiter_schema))
            .or_else(|| self.blocker_table.as_ref().map(|t| (t, &self.blocker_schema)));

        match attributed {
            Some((table, schema)) => LockedObject {
                name: table.clone(),
                object_type: "table".to_string(),
                schema: schema.clone(),
            },
            None => LockedObject {
                name: self.locktype.clone(),
                object_type: self.locktype.clone(),
                schema: None,
            },
        }
    }

    /// `ordinal` keeps ids unique when one session holds several locks of
    /// the same kind on the same object.
    pub fn into_snapshot(self, ordinal: usize) -> LockSnapshot {
        let object = self.object();
        let id = format!(
            "{}:{}:{}:{}:{ordinal}",
            self.pid, self.locktype, object.name, self.mode
        );

        LockSnapshot {
            id,
            lock_type: LockType::from_postgres(&self.locktype),
            mode: LockMode::from_postgres(&self.mode),
            mode_detail: self.mode,
            session_id: self.pid.to_string(),
            process_id: i64::from(self.pid),
            object_name: object.name,
            object_type: object.object_type,
            schema_name: object.schema,
            granted: self.granted,
            query: self.query.filter(|q| !q.trim().is_empty()),
            wait_start: self.waitstart,
            wait_duration: self.wait_seconds.map(|s| s.max(0.0)),
            blocked_by: self.blocked_by.iter().map(ToString::to_string).collect(),
        }
    }
}

pub(super) async fn fetch(
    pool: &PgPool,
    settings: &CollectorSettings,
) -> Result<Vec<LockSnapshot>, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = "SELECT lock, session, object, blockers FROM pg_locks JOIN pg_stat_activity",
        db.sql.table = "pg_locks"
    );

    let rows = sqlx::query(LOCKS_QUERY)
        .bind(sql_text_limit(settings.query_text_limit))
        .fetch_all(pool)
        .instrument(span)
        .await?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| PgLockRow::decode(row).map(|r| r.into_snapshot(i)))
        .collect()
}
