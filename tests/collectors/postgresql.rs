use super::common;
use anyhow::Result;
use lockscope::collectors::{CollectorSettings, LockCollector, PostgresCollector};
use lockscope::orchestrator::{Orchestrator, PooledCollectorProvider};
use lockscope::policy::AnalysisPolicy;
use lockscope::pool::{DatabaseId, TargetConfig};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const TABLE: &str = "lockscope_it_blocking";

fn collector(pool: PgPool) -> PostgresCollector {
    PostgresCollector::new(pool, DatabaseId::from("it"), CollectorSettings::default())
}

/// Holds an ACCESS EXCLUSIVE lock on the test table in an open transaction and
/// starts a reader that waits on it. Dropping the transaction releases both.
async fn blocked_reader(
    pool: &PgPool,
) -> Result<(sqlx::Transaction<'static, sqlx::Postgres>, JoinHandle<()>)> {
    sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {TABLE} (id INT PRIMARY KEY)"))
        .execute(pool)
        .await?;

    let mut holder = pool.begin().await?;
    sqlx::query(&format!("LOCK TABLE {TABLE} IN ACCESS EXCLUSIVE MODE"))
        .execute(&mut *holder)
        .await?;

    let reader_pool = pool.clone();
    let reader = tokio::spawn(async move {
        let _ = sqlx::query(&format!("SELECT count(*) FROM {TABLE}"))
            .execute(&reader_pool)
            .await;
    });

    tokio::time::sleep(Duration::from_millis(300)).await;

    Ok((holder, reader))
}

#[tokio::test]
#[ignore = "requires a local PostgreSQL"]
async fn test_health_check() -> Result<()> {
    let pool = common::create_test_pool().await?;

    assert!(collector(pool.clone()).health_check().await);

    pool.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local PostgreSQL"]
async fn test_waiting_lock_reports_blocker() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let collector = collector(pool.clone());
    let (holder, reader) = blocked_reader(&pool).await?;

    let locks = collector.collect_current_locks().await?;
    let waiting: Vec<_> = locks
        .iter()
        .filter(|l| !l.granted && l.object_name == TABLE)
        .collect();

    assert_eq!(waiting.len(), 1, "locks: {locks:?}");
    assert_eq!(waiting[0].blocked_by.len(), 1);
    assert!(waiting[0].query.as_deref().is_some_and(|q| q.contains(TABLE)));

    let chains = collector.collect_wait_chains().await?;
    assert!(chains.iter().any(|c| c.chain_length == 2 && !c.is_cycle));

    holder.rollback().await?;
    reader.await?;
    pool.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local PostgreSQL"]
async fn test_row_lock_wait_is_reported_on_its_table() -> Result<()> {
    const ROWS: &str = "lockscope_it_rows";

    let pool = common::create_test_pool().await?;
    let collector = collector(pool.clone());

    sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {ROWS} (id INT PRIMARY KEY, v INT)"))
        .execute(&pool)
        .await?;
    sqlx::query(&format!("INSERT INTO {ROWS} VALUES (1, 0) ON CONFLICT DO NOTHING"))
        .execute(&pool)
        .await?;

    let mut holder = pool.begin().await?;
    sqlx::query(&format!("UPDATE {ROWS} SET v = v + 1 WHERE id = 1"))
        .execute(&mut *holder)
        .await?;

    let writer_pool = pool.clone();
    let writer = tokio::spawn(async move {
        let _ = sqlx::query(&format!("UPDATE {ROWS} SET v = v + 1 WHERE id = 1"))
            .execute(&writer_pool)
            .await;
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let locks = collector.collect_current_locks().await?;
    let waiting: Vec<_> = locks
        .iter()
        .filter(|l| !l.granted && l.query.as_deref().is_some_and(|q| q.contains(ROWS)))
        .collect();

    assert!(!waiting.is_empty(), "locks: {locks:?}");
    assert!(waiting.iter().all(|l| l.object_name == ROWS), "locks: {locks:?}");

    holder.rollback().await?;
    writer.await?;
    pool.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local PostgreSQL"]
async fn test_statistics_first_sample_has_no_deadlock_count() -> Result<()> {
    let pool = common::create_test_pool().await?;
    let collector = collector(pool.clone());

    let stats = collector.collect_statistics(Duration::from_secs(60)).await?;

    assert_eq!(stats.deadlock_count, None);
    assert!(stats.timeout_count.is_some());
    assert!(stats.total_locks >= stats.waiting_locks);
    assert_eq!(stats.total_locks, stats.waiting_locks + stats.granted_locks);

    pool.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local PostgreSQL"]
async fn test_diagnostics_carry_server_version() -> Result<()> {
    let pool = common::create_test_pool().await?;

    let diagnostics = collector(pool.clone()).diagnostics().await;

    assert!(diagnostics.contains_key("server_version"), "{diagnostics:?}");

    pool.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a local PostgreSQL"]
async fn test_comprehensive_analysis_end_to_end() -> Result<()> {
    let policy = AnalysisPolicy::default();
    let provider = Arc::new(PooledCollectorProvider::new(&policy));
    let target = TargetConfig::from_dsn(&common::get_test_dsn_secret(), Some("local"), &policy.pool)?;
    let id = provider.register(target)?;
    let orchestrator = Orchestrator::builder(provider, policy).build();

    let pool = common::create_test_pool().await?;
    let (holder, reader) = blocked_reader(&pool).await?;

    let result = orchestrator
        .analyze_comprehensive(&id, Duration::from_secs(60))
        .await?;

    assert_eq!(result.database_id, "local");
    assert_eq!(result.backend, "postgresql");
    assert!(!result.wait_chains.is_empty());
    assert!((0.0..=100.0).contains(&result.health_score));

    holder.rollback().await?;
    reader.await?;
    orchestrator.shutdown().await;
    pool.close().await;
    Ok(())
}
