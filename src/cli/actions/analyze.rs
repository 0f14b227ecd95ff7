use crate::cache::shared::PgSharedStore;
use crate::cli::{
    actions::{AnalyzeOptions, OutputFormat, render},
    shutdown::shutdown_signal,
};
use crate::metrics::Metrics;
use crate::model::AnalysisResult;
use crate::orchestrator::{JsonLinesSink, Orchestrator, PooledCollectorProvider};
use crate::policy::AnalysisPolicy;
use crate::pool::{DatabaseId, TargetConfig};
use crate::strategies::{config::StrategyConfig, registry::StrategySet};
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

fn load_policy(opts: &AnalyzeOptions) -> Result<AnalysisPolicy> {
    let policy = match &opts.policy {
        Some(path) => AnalysisPolicy::from_file(path)?,
        None => AnalysisPolicy::default(),
    };
    policy.validate()?;
    Ok(policy)
}

async fn build(opts: &AnalyzeOptions, policy: AnalysisPolicy) -> Result<(Orchestrator, DatabaseId)> {
    let provider = Arc::new(PooledCollectorProvider::new(&policy));
    let target = TargetConfig::from_dsn(&opts.dsn, opts.id.as_deref(), &policy.pool)?;
    let database_id = provider.register(target)?;

    let strategies = StrategySet::new(&StrategyConfig::new().with_enabled(&opts.strategies));

    let mut builder = Orchestrator::builder(provider, policy)
        .strategies(strategies)
        .metrics(Arc::new(Metrics::new()));

    if let Some(path) = &opts.report_file {
        builder = builder.sink(Arc::new(JsonLinesSink::new(path.clone())));
    }

    if let Some(cache_dsn) = &opts.cache_dsn {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(cache_dsn.expose_secret())
            .await
            .context("failed to connect to the shared cache database")?;
        let store = PgSharedStore::connect(pool, PgSharedStore::DEFAULT_TABLE).await?;
        builder = builder.shared_cache(Arc::new(store));
    }

    Ok((builder.build(), database_id))
}

fn print(result: &AnalysisResult, format: OutputFormat) -> Result<()> {
    let mut out = std::io::stdout().lock();
    match format {
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string(result)?)?,
        OutputFormat::Text => writeln!(out, "{}", render::text(result))?,
    }
    out.flush()?;
    Ok(())
}

async fn watch(
    orchestrator: &Orchestrator,
    database_id: &DatabaseId,
    opts: &AnalyzeOptions,
    every: Duration,
) -> Result<()> {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("signal received, stopping watch");
                return Ok(());
            }
            _ = ticker.tick() => {
                match orchestrator.refresh(database_id, opts.window).await {
                    Ok(result) => print(&result, opts.format)?,
                    Err(e) if e.is_retryable() => error!(error = %e, "analysis failed, retrying next interval"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

/// Run one analysis, or repeat it until interrupted with `--watch`.
///
/// # Errors
///
/// Returns an error if the policy or DSN is invalid, the database cannot be
/// analyzed, or output cannot be written.
pub async fn handle(opts: AnalyzeOptions) -> Result<()> {
    let policy = load_policy(&opts)?;
    let (orchestrator, database_id) = build(&opts, policy).await?;

    info!(database = %database_id, window_secs = opts.window.as_secs(), "starting analysis");

    let outcome = match opts.watch {
        Some(every) => watch(&orchestrator, &database_id, &opts, every).await,
        None => match orchestrator.analyze_comprehensive(&database_id, opts.window).await {
            Ok(result) => print(&result, opts.format),
            Err(e) => Err(e.into()),
        },
    };

    if opts.metrics {
        let mut out = std::io::stdout().lock();
        write!(out, "{}", orchestrator.metrics().encode()?)?;
    }

    orchestrator.shutdown().await;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn options(policy: Option<std::path::PathBuf>) -> AnalyzeOptions {
        AnalyzeOptions {
            dsn: SecretString::from("postgresql://postgres@localhost:5432/postgres".to_string()),
            id: None,
            window: Duration::from_secs(60),
            format: OutputFormat::Text,
            watch: None,
            metrics: false,
            policy,
            report_file: None,
            cache_dsn: None,
            strategies: Vec::new(),
        }
    }

    #[test]
    fn test_load_policy_default() -> Result<()> {
        assert_eq!(load_policy(&options(None))?, AnalysisPolicy::default());
        Ok(())
    }

    #[test]
    fn test_load_policy_rejects_invalid_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"cache": {{"local_capacity": 0}}}}"#)?;

        assert!(load_policy(&options(Some(file.path().to_path_buf()))).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_build_registers_target() -> Result<()> {
        let mut opts = options(None);
        opts.id = Some("primary".to_string());
        opts.strategies = vec!["deadlock".to_string()];

        let (orchestrator, id) = build(&opts, AnalysisPolicy::default()).await?;

        assert_eq!(id.as_str(), "primary");
        assert_eq!(orchestrator.strategy_names(), vec!["deadlock"]);
        Ok(())
    }
}
