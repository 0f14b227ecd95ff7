use crate::strategies::{STRATEGY_NAMES, Strategy, all_strategies};
use std::collections::HashSet;

#[derive(Clone, Debug, Default)]
pub struct StrategyConfig {
    pub enabled_strategies: HashSet<String>,
}

impl StrategyConfig {
    /// Create an empty config
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every registered strategy that is on unless switched off.
    #[must_use]
    pub fn defaults() -> Self {
        let factories = all_strategies();
        let enabled = STRATEGY_NAMES
            .iter()
            .filter(|name| factories.get(*name).is_some_and(|f| f().enabled_by_default()))
            .map(|name| (*name).to_string())
            .collect();

        Self {
            enabled_strategies: enabled,
        }
    }

    /// Enable strategies by name
    #[must_use]
    pub fn with_enabled(mut self, strategies: &[String]) -> Self {
        self.enabled_strategies = strategies.iter().cloned().collect();
        self
    }

    /// Check if a strategy is enabled
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled_strategies.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_everything_registered() {
        let config = StrategyConfig::defaults();
        for name in STRATEGY_NAMES {
            assert!(config.is_enabled(name), "{name} should be on by default");
        }
    }

    #[test]
    fn test_with_enabled() {
        let config = StrategyConfig::new().with_enabled(&["index".to_string()]);
        assert!(config.is_enabled("index"));
        assert!(!config.is_enabled("deadlock"));
    }
}
