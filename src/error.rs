use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The collection call a failure or gap refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionCall {
    HealthCheck,
    Locks,
    WaitChains,
    Statistics,
}

impl CollectionCall {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HealthCheck => "health_check",
            Self::Locks => "locks",
            Self::WaitChains => "wait_chains",
            Self::Statistics => "statistics",
        }
    }
}

impl fmt::Display for CollectionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a failed collection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionErrorKind {
    Connectivity,
    Timeout,
    Permission,
    Query,
    Decode,
}

impl fmt::Display for CollectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connectivity => "connectivity",
            Self::Timeout => "timeout",
            Self::Permission => "permission",
            Self::Query => "query",
            Self::Decode => "decode",
        };
        f.write_str(s)
    }
}

/// A single collection call failed. Other calls of the same analysis may
/// still have succeeded.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{call} collection failed ({kind}): {cause}")]
pub struct CollectionError {
    pub kind: CollectionErrorKind,
    pub call: CollectionCall,
    pub cause: String,
}

impl CollectionError {
    pub fn new(kind: CollectionErrorKind, call: CollectionCall, cause: impl Into<String>) -> Self {
        Self {
            kind,
            call,
            cause: cause.into(),
        }
    }

    #[must_use]
    pub fn timeout(call: CollectionCall, after: Duration) -> Self {
        Self::new(
            CollectionErrorKind::Timeout,
            call,
            format!("deadline of {}ms exceeded", after.as_millis()),
        )
    }

    /// Classify a sqlx error raised while running `call`.
    #[must_use]
    pub fn from_sqlx(call: CollectionCall, err: &sqlx::Error) -> Self {
        let kind = match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => CollectionErrorKind::Connectivity,
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => CollectionErrorKind::Decode,
            sqlx::Error::Database(db) if is_permission_denied(db.code().as_deref()) => {
                CollectionErrorKind::Permission
            }
            _ => CollectionErrorKind::Query,
        };

        Self::new(kind, call, err.to_string())
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, CollectionErrorKind::Timeout)
    }
}

// 42501 is PostgreSQL's insufficient_privilege; 1142/1227 are MySQL's
// table-access and specific-privilege denials.
fn is_permission_denied(code: Option<&str>) -> bool {
    matches!(code, Some("42501" | "1142" | "1227"))
}

/// Errors surfaced by the analysis engine.
///
/// The type is `Clone` so that every caller joined onto one in-flight
/// analysis receives the same failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    /// The target database could not be reached after all retries.
    #[error("cannot connect to {database_id} after {attempts} attempt(s): {cause}")]
    Connectivity {
        database_id: String,
        attempts: u32,
        cause: String,
    },

    /// Every collection call exceeded its deadline.
    #[error("collection for {database_id} timed out ({calls})")]
    CollectionTimeout { database_id: String, calls: String },

    /// Every collection call failed and at least one failure was not a timeout.
    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("unsupported backend type '{0}'")]
    UnsupportedBackend(String),

    #[error("backend '{backend}' cannot use a {pool} pool")]
    BackendMismatch { backend: String, pool: &'static str },

    #[error("unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("analyzer '{analyzer}' failed: {cause}")]
    AnalyzerFailure { analyzer: String, cause: String },

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Whether retrying the same call later could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::CollectionTimeout { .. } | Self::Collection(_)
        )
    }
}
