use crate::cli::{
    actions::{Action, AnalyzeOptions, OutputFormat},
    commands::enabled_strategies,
};
use anyhow::{Result, anyhow};
use clap::ArgMatches;
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub fn handler(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some(("analyze", sub)) => analyze(sub),
        Some(("backends", _)) => Ok(Action::Backends),
        Some((other, _)) => Err(anyhow!("unknown command '{other}'")),
        None => Err(anyhow!("a command is required, see --help")),
    }
}

fn analyze(matches: &ArgMatches) -> Result<Action> {
    // Get the DSN or return an error
    let dsn = SecretString::from(
        matches
            .get_one::<String>("dsn")
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("DSN is required. Please provide it using the --dsn flag."))?,
    );

    let window = matches
        .get_one::<Duration>("window")
        .copied()
        .ok_or_else(|| anyhow!("Window is required. Please provide it using the --window flag."))?;

    let format = match matches.get_one::<String>("format").map(String::as_str) {
        Some("json") => OutputFormat::Json,
        _ => OutputFormat::Text,
    };

    let strategies = enabled_strategies(matches);
    debug!(?strategies, "enabled strategies");

    Ok(Action::Analyze(Box::new(AnalyzeOptions {
        dsn,
        id: matches.get_one::<String>("id").cloned(),
        window,
        format,
        watch: matches.get_one::<Duration>("watch").copied(),
        metrics: matches.get_flag("metrics"),
        policy: matches.get_one::<PathBuf>("policy").cloned(),
        report_file: matches.get_one::<PathBuf>("report-file").cloned(),
        cache_dsn: matches
            .get_one::<String>("cache-dsn")
            .map(|s| SecretString::from(s.to_string())),
        strategies,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    fn dispatch(args: &[&str]) -> Result<Action> {
        let mut argv = vec!["lockscope"];
        argv.extend_from_slice(args);
        handler(&commands::new().get_matches_from(argv))
    }

    #[test]
    fn test_backends() -> Result<()> {
        assert!(matches!(dispatch(&["backends"])?, Action::Backends));
        Ok(())
    }

    #[test]
    fn test_analyze_options() -> Result<()> {
        let action = dispatch(&[
            "analyze",
            "--dsn",
            "mysql://app@db:3306/shop",
            "--id",
            "shop",
            "--window",
            "5m",
            "--format",
            "json",
            "--watch",
            "30s",
            "--metrics",
            "--no-strategy.query",
        ])?;

        let Action::Analyze(opts) = action else {
            panic!("expected analyze action");
        };

        assert_eq!(opts.dsn.expose_secret(), "mysql://app@db:3306/shop");
        assert_eq!(opts.id.as_deref(), Some("shop"));
        assert_eq!(opts.window, Duration::from_secs(300));
        assert_eq!(opts.format, OutputFormat::Json);
        assert_eq!(opts.watch, Some(Duration::from_secs(30)));
        assert!(opts.metrics);
        assert!(!opts.strategies.contains(&"query".to_string()));
        assert!(opts.strategies.contains(&"index".to_string()));
        Ok(())
    }
}
