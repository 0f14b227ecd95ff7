use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;
use std::time::Duration;

mod strategies;

pub use strategies::enabled_strategies;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Parse `500ms`, `90s`, `5m`, `2h` or a bare number of seconds.
///
/// # Errors
///
/// Returns an error for unknown units, non-numeric values and zero.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);

    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;

    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3_600)),
        other => return Err(format!("unknown duration unit '{other}' in '{value}'")),
    };

    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(duration)
}

fn analyze() -> Command {
    let cmd = Command::new("analyze")
        .about("Analyze lock contention on one database")
        .arg(
            Arg::new("dsn")
                .long("dsn")
                .help("Database connection string (postgresql:// or mysql://)")
                .default_value("postgresql://postgres@localhost:5432/postgres")
                .env("LOCKSCOPE_DSN")
                .value_name("DSN"),
        )
        .arg(
            Arg::new("id")
                .long("id")
                .help("Identity of the database in cache keys and reports [default: database@host:port]")
                .env("LOCKSCOPE_ID")
                .value_name("ID"),
        )
        .arg(
            Arg::new("window")
                .short('w')
                .long("window")
                .help("Trailing window the statistics cover")
                .default_value("60s")
                .env("LOCKSCOPE_WINDOW")
                .value_parser(parse_duration),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .help("Output format")
                .default_value("text")
                .env("LOCKSCOPE_FORMAT")
                .value_parser(["text", "json"]),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .help("Repeat the analysis at this interval until interrupted")
                .env("LOCKSCOPE_WATCH")
                .value_name("INTERVAL")
                .value_parser(parse_duration),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .help("Print internal metrics in Prometheus text format on exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("policy")
                .long("policy")
                .help("JSON file overriding thresholds, weights, timeouts and TTLs")
                .env("LOCKSCOPE_POLICY")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("report-file")
                .long("report-file")
                .help("Append every result as one JSON line to this file")
                .env("LOCKSCOPE_REPORT_FILE")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("cache-dsn")
                .long("cache-dsn")
                .help("PostgreSQL DSN of the shared cache tier (local cache only when unset)")
                .env("LOCKSCOPE_CACHE_DSN")
                .value_name("DSN"),
        );

    strategies::add_strategy_args(cmd)
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("lockscope")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(built_info::GIT_COMMIT_HASH.unwrap_or(env!("CARGO_PKG_VERSION")))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .global(true)
                .action(ArgAction::Count),
        )
        .subcommand(analyze())
        .subcommand(Command::new("backends").about("List the supported database backends"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("60s"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7_200)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    }

    #[test]
    fn test_parse_duration_rejects() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "lockscope");
        assert_eq!(
            command.get_about().unwrap().to_string(),
            env!("CARGO_PKG_DESCRIPTION")
        );
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_analyze_defaults() {
        temp_env::with_vars(
            [
                ("LOCKSCOPE_DSN", None::<&str>),
                ("LOCKSCOPE_WINDOW", None),
                ("LOCKSCOPE_FORMAT", None),
                ("LOCKSCOPE_WATCH", None),
            ],
            || {
                let matches = new().get_matches_from(vec!["lockscope", "analyze"]);
                let (name, sub) = matches.subcommand().unwrap();

                assert_eq!(name, "analyze");
                assert_eq!(
                    sub.get_one::<String>("dsn").map(String::as_str),
                    Some("postgresql://postgres@localhost:5432/postgres")
                );
                assert_eq!(
                    sub.get_one::<Duration>("window").copied(),
                    Some(Duration::from_secs(60))
                );
                assert_eq!(sub.get_one::<String>("format").map(String::as_str), Some("text"));
                assert!(sub.get_one::<Duration>("watch").is_none());
                assert!(!sub.get_flag("metrics"));
            },
        );
    }

    #[test]
    fn test_window_from_env() {
        temp_env::with_var("LOCKSCOPE_WINDOW", Some("5m"), || {
            let matches = new().get_matches_from(vec!["lockscope", "analyze"]);
            let (_, sub) = matches.subcommand().unwrap();

            assert_eq!(
                sub.get_one::<Duration>("window").copied(),
                Some(Duration::from_secs(300))
            );
        });
    }

    #[test]
    fn test_invalid_format_rejected() {
        let result = new().try_get_matches_from(vec!["lockscope", "analyze", "--format", "xml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verbose_is_global() {
        let matches = new().get_matches_from(vec!["lockscope", "analyze", "-vv"]);
        assert_eq!(matches.get_count("verbose"), 2);
    }
}
