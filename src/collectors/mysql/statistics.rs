use crate::collectors::util::{
    CounterWindow, LockCount, WaitTotals, assemble_statistics, count_column, windowed_count,
};
use crate::model::{LockStatistics, LockType};
use sqlx::{MySqlPool, Row};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

pub(super) fn census_entry(lock_type: &str, status: &str, count: Option<i64>) -> LockCount {
    (
        LockType::from_mysql(lock_type).as_str().to_string(),
        status.eq_ignore_ascii_case("GRANTED"),
        count_column(count),
    )
}

pub(super) fn wait_totals_from(
    waiting: Option<i64>,
    total_wait: Option<f64>,
    max_wait: Option<f64>,
) -> WaitTotals {
    WaitTotals {
        waiting: count_column(waiting),
        total_secs: total_wait.unwrap_or(0.0).max(0.0),
        max_secs: max_wait.unwrap_or(0.0).max(0.0),
    }
}

/// Cumulative InnoDB lock counters; `None` when the metric row is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct InnodbCounters {
    pub deadlocks: Option<i64>,
    pub timeouts: Option<i64>,
}

impl InnodbCounters {
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<i64>)>,
    {
        let mut counters = Self::default();
        for (name, value) in rows {
            match name.to_ascii_lowercase().as_str() {
                "lock_deadlocks" => counters.deadlocks = value,
                "lock_timeouts" => counters.timeouts = value,
                _ => {}
            }
        }
        counters
    }
}

async fn lock_census(pool: &MySqlPool) -> Result<Vec<LockCount>, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "mysql",
        db.operation = "SELECT",
        db.statement = "SELECT LOCK_TYPE, LOCK_STATUS, COUNT(*) FROM performance_schema.data_locks GROUP BY 1, 2",
        db.sql.table = "data_locks"
    );

    let rows = sqlx::query(
        r"
        SELECT LOCK_TYPE AS lock_type, LOCK_STATUS AS lock_status, COUNT(*) AS count
        FROM performance_schema.data_locks
        WHERE OBJECT_SCHEMA = DATABASE()
        GROUP BY LOCK_TYPE, LOCK_STATUS
        ",
    )
    .fetch_all(pool)
    .instrument(span)
    .await?;

    let mut census = Vec::with_capacity(rows.len());
    for row in &rows {
        let lock_type: String = row.try_get("lock_type")?;
        let status: String = row.try_get("lock_status")?;
        census.push(census_entry(&lock_type, &status, row.try_get("count")?));
    }

    Ok(census)
}

async fn wait_totals(pool: &MySqlPool) -> Result<WaitTotals, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "mysql",
        db.operation = "SELECT",
        db.statement = "SELECT count, sum, max of lock waits FROM information_schema.innodb_trx",
        db.sql.table = "innodb_trx"
    );

    let row = sqlx::query(
        r"
        SELECT
            COUNT(*) AS waiting,
            CAST(COALESCE(SUM(w), 0) AS DOUBLE) AS total_wait,
            CAST(COALESCE(MAX(w), 0) AS DOUBLE) AS max_wait
        FROM (
            SELECT TIMESTAMPDIFF(MICROSECOND, trx_wait_started, NOW(6)) / 1000000 AS w
            FROM information_schema.innodb_trx
            WHERE trx_state = 'LOCK WAIT'
        ) waits
        ",
    )
    .fetch_one(pool)
    .instrument(span)
    .await?;

    Ok(wait_totals_from(
        row.try_get("waiting")?,
        row.try_get("total_wait")?,
        row.try_get("max_wait")?,
    ))
}

async fn innodb_counters(pool: &MySqlPool) -> Result<InnodbCounters, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "mysql",
        db.operation = "SELECT",
        db.statement = "SELECT NAME, COUNT FROM information_schema.INNODB_METRICS WHERE NAME IN (lock_deadlocks, lock_timeouts)",
        db.sql.table = "INNODB_METRICS"
    );

    let rows = sqlx::query(
        r"
        SELECT NAME AS name, `COUNT` AS value
        FROM information_schema.INNODB_METRICS
        WHERE NAME IN ('lock_deadlocks', 'lock_timeouts')
        ",
    )
    .fetch_all(pool)
    .instrument(span)
    .await?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        decoded.push((row.try_get("name")?, row.try_get("value")?));
    }

    Ok(InnodbCounters::from_rows(decoded))
}

pub(super) struct Counters<'a> {
    pub deadlocks: &'a CounterWindow,
    pub timeouts: &'a CounterWindow,
}

pub(super) fn build(
    window: Duration,
    census: &[LockCount],
    waits: WaitTotals,
    totals: InnodbCounters,
    counters: &Counters<'_>,
    at: Instant,
) -> LockStatistics {
    let deadlock_count = windowed_count(counters.deadlocks, totals.deadlocks, at, window);
    let timeout_count = windowed_count(counters.timeouts, totals.timeouts, at, window);

    debug!(
        deadlock_total = ?totals.deadlocks,
        timeout_total = ?totals.timeouts,
        ?deadlock_count,
        ?timeout_count,
        waiting = waits.waiting,
        "sampled lock statistics"
    );

    assemble_statistics(window, census, waits, deadlock_count, timeout_count)
}

pub(super) async fn fetch(
    pool: &MySqlPool,
    counters: &Counters<'_>,
    window: Duration,
) -> Result<LockStatistics, sqlx::Error> {
    let (census, waits, totals) =
        tokio::try_join!(lock_census(pool), wait_totals(pool), innodb_counters(pool))?;

    Ok(build(window, &census, waits, totals, counters, Instant::now()))
}
