macro_rules! register_strategies {
    (
        $(
            $module:ident => $strategy_type:ident
        ),* $(,)?
    ) => {
        $(
            pub mod $module;
            pub use $module::$strategy_type;
        )*

        #[derive(Clone, Debug)]
        pub enum StrategyType {
            $(
                $strategy_type($strategy_type),
            )*
        }

        impl Strategy for StrategyType {
            fn name(&self) -> &'static str {
                match self {
                    $(
                        StrategyType::$strategy_type(s) => s.name(),
                    )*
                }
            }

            fn enabled_by_default(&self) -> bool {
                match self {
                    $(
                        StrategyType::$strategy_type(s) => s.enabled_by_default(),
                    )*
                }
            }

            fn generate(&self, result: &AnalysisResult) -> Vec<OptimizationAdvice> {
                match self {
                    $(
                        StrategyType::$strategy_type(s) => s.generate(result),
                    )*
                }
            }
        }

        pub fn all_strategies() -> HashMap<&'static str, fn() -> StrategyType> {
            let mut map: HashMap<&'static str, fn() -> StrategyType> = HashMap::new();
            $(
                map.insert(
                    stringify!($module),
                    || StrategyType::$strategy_type($strategy_type::new()),
                );
            )*
            map
        }

        // Also drives the generated `--strategy.<name>` CLI flags.
        pub const STRATEGY_NAMES: &[&'static str] = &[
            $(stringify!($module),)*
        ];
    };
}
