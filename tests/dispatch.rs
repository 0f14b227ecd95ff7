use anyhow::Result;
use lockscope::cli::{
    actions::{Action, OutputFormat},
    commands, dispatch,
};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::time::Duration;

const VARS: [&str; 7] = [
    "LOCKSCOPE_DSN",
    "LOCKSCOPE_ID",
    "LOCKSCOPE_WINDOW",
    "LOCKSCOPE_FORMAT",
    "LOCKSCOPE_WATCH",
    "LOCKSCOPE_POLICY",
    "LOCKSCOPE_REPORT_FILE",
];

fn analyze_from(args: &[&str]) -> Result<Box<lockscope::cli::actions::AnalyzeOptions>> {
    let mut argv = vec!["lockscope", "analyze"];
    argv.extend_from_slice(args);

    match dispatch::handler(&commands::new().get_matches_from(argv))? {
        Action::Analyze(opts) => Ok(opts),
        Action::Backends => anyhow::bail!("expected analyze"),
    }
}

/// Run `f` with every `LOCKSCOPE_*` variable unset except those in `set`.
fn with_env<R>(set: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
    let vars: Vec<(&str, Option<&str>)> = VARS
        .iter()
        .map(|&name| {
            let value = set.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);
            (name, value)
        })
        .collect();
    temp_env::with_vars(vars, f)
}

fn cleared<R>(f: impl FnOnce() -> R) -> R {
    with_env(&[], f)
}

#[test]
fn test_defaults() -> Result<()> {
    cleared(|| {
        let opts = analyze_from(&[])?;

        assert_eq!(
            opts.dsn.expose_secret(),
            "postgresql://postgres@localhost:5432/postgres"
        );
        assert_eq!(opts.id, None);
        assert_eq!(opts.window, Duration::from_secs(60));
        assert_eq!(opts.format, OutputFormat::Text);
        assert_eq!(opts.watch, None);
        assert!(!opts.metrics);
        assert_eq!(opts.policy, None);
        assert_eq!(opts.strategies.len(), 4);
        Ok(())
    })
}

#[test]
fn test_env_fallbacks() -> Result<()> {
    with_env(
        &[
            ("LOCKSCOPE_DSN", "mysql://root:pw@db.local:3306/shop"),
            ("LOCKSCOPE_WINDOW", "2h"),
            ("LOCKSCOPE_FORMAT", "json"),
            ("LOCKSCOPE_WATCH", "45s"),
            ("LOCKSCOPE_POLICY", "/etc/lockscope/policy.json"),
        ],
        || {
            let opts = analyze_from(&[])?;

            assert_eq!(opts.dsn.expose_secret(), "mysql://root:pw@db.local:3306/shop");
            assert_eq!(opts.window, Duration::from_secs(7_200));
            assert_eq!(opts.format, OutputFormat::Json);
            assert_eq!(opts.watch, Some(Duration::from_secs(45)));
            assert_eq!(opts.policy, Some(PathBuf::from("/etc/lockscope/policy.json")));
            Ok(())
        },
    )
}

#[test]
fn test_flags_override_env() -> Result<()> {
    with_env(&[("LOCKSCOPE_WINDOW", "2h")], || {
        let opts = analyze_from(&["--window", "30s", "--id", "primary"])?;

        assert_eq!(opts.window, Duration::from_secs(30));
        assert_eq!(opts.id.as_deref(), Some("primary"));
        Ok(())
    })
}

#[test]
fn test_strategy_flags() -> Result<()> {
    cleared(|| {
        let opts = analyze_from(&["--no-strategy.lock_timeout", "--no-strategy.query"])?;

        assert_eq!(opts.strategies, vec!["index", "deadlock"]);
        Ok(())
    })
}

#[test]
fn test_invalid_window_rejected() {
    cleared(|| {
        let result =
            commands::new().try_get_matches_from(vec!["lockscope", "analyze", "--window", "soon"]);
        assert!(result.is_err());
    });
}

#[test]
fn test_backends_command() -> Result<()> {
    let matches = commands::new().get_matches_from(vec!["lockscope", "backends"]);
    assert!(matches!(dispatch::handler(&matches)?, Action::Backends));
    assert_eq!(lockscope::list_supported_backend_types(), vec!["mysql", "postgresql"]);
    Ok(())
}
