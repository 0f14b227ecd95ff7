use crate::collectors::CollectorSettings;
use crate::collectors::util::{
    CounterWindow, LockCount, WaitTotals, assemble_statistics, count_column, windowed_count,
};
use crate::model::{LockStatistics, LockType};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

pub(super) fn census_entry(locktype: &str, granted: bool, count: Option<i64>) -> LockCount {
    (
        LockType::from_postgres(locktype).as_str().to_string(),
        granted,
        count_column(count),
    )
}

/// Decoded aggregate row of the waiting-locks query.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(super) struct PgWaitRow {
    pub waiting: Option<i64>,
    pub total_wait: Option<f64>,
    pub max_wait: Option<f64>,
    pub over_ceiling: Option<i64>,
}

impl PgWaitRow {
    /// Wait totals plus the number of waits at or past the timeout ceiling.
    pub fn into_totals(self) -> (WaitTotals, u64) {
        (
            WaitTotals {
                waiting: count_column(self.waiting),
                total_secs: self.total_wait.unwrap_or(0.0).max(0.0),
                max_secs: self.max_wait.unwrap_or(0.0).max(0.0),
            },
            count_column(self.over_ceiling),
        )
    }
}

async fn lock_census(pool: &PgPool) -> Result<Vec<LockCount>, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = "SELECT locktype, granted, count(*) FROM pg_locks GROUP BY 1, 2",
        db.sql.table = "pg_locks"
    );

    let rows = sqlx::query(
        r"
        SELECT locktype, granted, COUNT(*) AS count
        FROM pg_locks
        WHERE pid IS NOT NULL AND pid <> pg_backend_pid()
        GROUP BY locktype, granted
        ",
    )
    .fetch_all(pool)
    .instrument(span)
    .await?;

    let mut census = Vec::with_capacity(rows.len());
    for row in &rows {
        let locktype: String = row.try_get("locktype")?;
        let granted: bool = row.try_get("granted")?;
        census.push(census_entry(&locktype, granted, row.try_get("count")?));
    }

    Ok(census)
}

async fn wait_totals(pool: &PgPool, ceiling_secs: f64) -> Result<PgWaitRow, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = "SELECT count, sum, max of lock waits FROM pg_locks JOIN pg_stat_activity",
        db.sql.table = "pg_locks"
    );

    let row = sqlx::query(
        r"
        SELECT
            COUNT(*) AS waiting,
            COALESCE(SUM(w), 0)::float8 AS total_wait,
            COALESCE(MAX(w), 0)::float8 AS max_wait,
            COUNT(*) FILTER (WHERE w >= $1) AS over_ceiling
        FROM (
            SELECT EXTRACT(EPOCH FROM (clock_timestamp() - COALESCE(l.waitstart, a.state_change)))::float8 AS w
            FROM pg_locks l
            LEFT JOIN pg_stat_activity a ON a.pid = l.pid
            WHERE NOT l.granted AND l.pid <> pg_backend_pid()
        ) waits
        ",
    )
    .bind(ceiling_secs)
    .fetch_one(pool)
    .instrument(span)
    .await?;

    Ok(PgWaitRow {
        waiting: row.try_get("waiting")?,
        total_wait: row.try_get("total_wait")?,
        max_wait: row.try_get("max_wait")?,
        over_ceiling: row.try_get("over_ceiling")?,
    })
}

/// Cumulative `pg_stat_database.deadlocks`; `None` without a stats row.
async fn deadlock_counter(pool: &PgPool) -> Result<Option<i64>, sqlx::Error> {
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = "SELECT deadlocks FROM pg_stat_database WHERE datname = current_database()",
        db.sql.table = "pg_stat_database"
    );

    let deadlocks = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT deadlocks FROM pg_stat_database WHERE datname = current_database()",
    )
    .fetch_optional(pool)
    .instrument(span)
    .await?
    .flatten();

    Ok(deadlocks)
}

/// Window statistics from one round of samples. Timeouts are the waits at
/// or past the ceiling, since PostgreSQL keeps no lock timeout counter.
pub(super) fn build(
    window: Duration,
    census: &[LockCount],
    waits: PgWaitRow,
    deadlock_total: Option<i64>,
    deadlocks: &CounterWindow,
    at: Instant,
) -> LockStatistics {
    let (totals, over_ceiling) = waits.into_totals();
    let deadlock_count = windowed_count(deadlocks, deadlock_total, at, window);

    debug!(
        ?deadlock_total,
        ?deadlock_count,
        timeouts = over_ceiling,
        waiting = totals.waiting,
        "sampled lock statistics"
    );

    assemble_statistics(window, census, totals, deadlock_count, Some(over_ceiling))
}

pub(super) async fn fetch(
    pool: &PgPool,
    settings: &CollectorSettings,
    deadlocks: &CounterWindow,
    window: Duration,
) -> Result<LockStatistics, sqlx::Error> {
    let (census, waits, deadlock_total) = tokio::try_join!(
        lock_census(pool),
        wait_totals(pool, settings.timeout_ceiling_secs),
        deadlock_counter(pool),
    )?;

    Ok(build(window, &census, waits, deadlock_total, deadlocks, Instant::now()))
}
