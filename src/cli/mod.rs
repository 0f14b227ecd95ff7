pub mod actions;
pub mod commands;
pub mod dispatch;
pub mod shutdown;
pub mod telemetry;

mod start;
pub use self::start::start;
