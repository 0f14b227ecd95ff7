use crate::strategies::{STRATEGY_NAMES, Strategy, all_strategies};
use clap::{Arg, ArgAction, ArgMatches, Command};

fn flag_names(name: &str) -> (&'static str, &'static str) {
    // clap wants 'static ids; the set is fixed at startup.
    let enable: &'static str = Box::leak(format!("strategy.{name}").into_boxed_str());
    let disable: &'static str = Box::leak(format!("no-strategy.{name}").into_boxed_str());
    (enable, disable)
}

pub fn add_strategy_args(mut cmd: Command) -> Command {
    let factories = all_strategies();

    for &name in STRATEGY_NAMES {
        let default_enabled = factories.get(name).is_some_and(|f| f().enabled_by_default());
        let (enable_flag, disable_flag) = flag_names(name);

        let default_indicator = if default_enabled {
            " [default: enabled]"
        } else {
            " [default: disabled]"
        };
        let enable_help: &'static str = Box::leak(
            format!("Enable the {name} advice strategy{default_indicator}").into_boxed_str(),
        );
        let disable_help: &'static str =
            Box::leak(format!("Disable the {name} advice strategy").into_boxed_str());

        cmd = cmd
            .arg(
                Arg::new(enable_flag)
                    .long(enable_flag)
                    .help(enable_help)
                    .action(ArgAction::SetTrue)
                    .default_value(if default_enabled { "true" } else { "false" }),
            )
            .arg(
                Arg::new(disable_flag)
                    .long(disable_flag)
                    .help(disable_help)
                    .action(ArgAction::SetTrue)
                    .overrides_with(enable_flag),
            );
    }
    cmd
}

/// Strategy names switched on by the `--strategy.*` / `--no-strategy.*`
/// flags, falling back to each strategy's default.
pub fn enabled_strategies(matches: &ArgMatches) -> Vec<String> {
    STRATEGY_NAMES
        .iter()
        .filter(|&&name| {
            if matches.get_flag(&format!("no-strategy.{name}")) {
                return false;
            }

            // Unset enable flags carry the strategy's default.
            matches.get_flag(&format!("strategy.{name}"))
        })
        .map(|&name| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    fn analyze_matches(args: &[&str]) -> ArgMatches {
        let mut argv = vec!["lockscope", "analyze"];
        argv.extend_from_slice(args);
        let matches = commands::new().get_matches_from(argv);
        matches.subcommand_matches("analyze").cloned().unwrap()
    }

    #[test]
    fn test_enabled_strategies_defaults() {
        let enabled = enabled_strategies(&analyze_matches(&[]));

        assert_eq!(enabled, vec!["index", "query", "deadlock", "lock_timeout"]);
    }

    #[test]
    fn test_disable_strategy() {
        let enabled = enabled_strategies(&analyze_matches(&["--no-strategy.index"]));

        assert!(!enabled.contains(&"index".to_string()));
        assert!(enabled.contains(&"deadlock".to_string()));
    }

    #[test]
    fn test_disable_all() {
        let enabled = enabled_strategies(&analyze_matches(&[
            "--no-strategy.index",
            "--no-strategy.query",
            "--no-strategy.deadlock",
            "--no-strategy.lock_timeout",
        ]));

        assert!(enabled.is_empty());
    }
}
