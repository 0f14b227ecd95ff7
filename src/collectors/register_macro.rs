macro_rules! register_backends {
    (
        $(
            $module:ident => $backend_type:ident
        ),* $(,)?
    ) => {
        $(
            pub mod $module;
            pub use $module::$backend_type;
        )*

        /// Constructor for every compiled-in backend, keyed by backend name.
        pub fn all_backends() -> HashMap<&'static str, BackendConstructor> {
            let mut map: HashMap<&'static str, BackendConstructor> = HashMap::new();
            $(
                map.insert(stringify!($module), |pool, id, settings| {
                    $backend_type::from_pool(pool, id, settings)
                        .map(|c| Arc::new(c) as Arc<dyn LockCollector>)
                });
            )*
            map
        }

        // Backend names in registration order.
        pub const BACKEND_NAMES: &[&'static str] = &[
            $(stringify!($module),)*
        ];
    };
}
