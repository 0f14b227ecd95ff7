//! Pure transformations from collected lock data to findings. Nothing in
//! here touches the network; every analyzer is deterministic for a given
//! input.

pub mod contention;
pub mod health;
pub mod wait_chain;

pub use contention::{ContentionAnalyzer, ContentionHistory, ObjectKey};
pub use health::{HealthInputs, HealthScorer};
pub use wait_chain::{SessionNode, WaitChainAnalyzer, WaitGraph};
