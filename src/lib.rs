//! Lock-contention analysis for PostgreSQL and MySQL.
//!
//! The pipeline samples a target database's locks, rebuilds the wait-for
//! graph, finds deadlock cycles, classifies contention hot spots, scores lock
//! health and ranks remediation advice. [`orchestrator::Orchestrator`] is the
//! entry point; the `lockscope` binary drives it from the command line.

pub mod analyzers;
pub mod cache;
pub mod cli;
pub mod collectors;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod pool;
pub mod strategies;

pub use error::{AnalysisError, CollectionError};
pub use model::AnalysisResult;
pub use orchestrator::Orchestrator;

/// Names of the database backends a collector exists for, sorted.
#[must_use]
pub fn list_supported_backend_types() -> Vec<&'static str> {
    collectors::registry::BackendRegistry::new().list_supported_types()
}

#[allow(clippy::cast_precision_loss)]
pub(crate) const fn i64_to_f64(value: i64) -> f64 {
    value as f64
}

#[allow(clippy::cast_precision_loss)]
pub(crate) const fn u64_to_f64(value: u64) -> f64 {
    value as f64
}
