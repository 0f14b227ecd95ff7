//! Strongly typed entities produced and consumed by the analysis pipeline.
//!
//! Every duration is expressed in seconds as `f64` so the types serialize
//! to plain numbers for the shared cache tier and external consumers.

use crate::error::CollectionCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Backend session identifier (PostgreSQL pid, MySQL thread/trx id, ...).
pub type SessionId = String;

/// Severity of a wait chain, also used as the priority of contentions and
/// advice. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Relation,
    Row,
    Page,
    Advisory,
    Transaction,
    Object,
    Other,
}

impl LockType {
    /// Map a `pg_locks.locktype` value.
    #[must_use]
    pub fn from_postgres(locktype: &str) -> Self {
        match locktype {
            "relation" | "extend" => Self::Relation,
            "tuple" => Self::Row,
            "page" => Self::Page,
            "advisory" => Self::Advisory,
            "transactionid" | "virtualxid" | "spectoken" => Self::Transaction,
            "object" => Self::Object,
            _ => Self::Other,
        }
    }

    /// Map a `performance_schema.data_locks.LOCK_TYPE` value.
    #[must_use]
    pub fn from_mysql(lock_type: &str) -> Self {
        match lock_type.to_ascii_uppercase().as_str() {
            "TABLE" => Self::Relation,
            "RECORD" => Self::Row,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relation => "relation",
            Self::Row => "row",
            Self::Page => "page",
            Self::Advisory => "advisory",
            Self::Transaction => "transaction",
            Self::Object => "object",
            Self::Other => "other",
        }
    }
}

/// Normalized lock mode. The backend's own mode name is kept alongside in
/// [`LockSnapshot::mode_detail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentShared,
    IntentExclusive,
    SharedIntentExclusive,
}

impl LockMode {
    #[must_use]
    pub fn from_postgres(mode: &str) -> Self {
        match mode {
            "AccessShareLock" | "RowShareLock" => Self::IntentShared,
            "RowExclusiveLock" => Self::IntentExclusive,
            "ShareLock" => Self::Shared,
            "ShareUpdateExclusiveLock" | "ShareRowExclusiveLock" => Self::SharedIntentExclusive,
            _ => Self::Exclusive,
        }
    }

    /// MySQL reports modes such as `X,REC_NOT_GAP` or `IX`; only the leading
    /// token is significant here.
    #[must_use]
    pub fn from_mysql(mode: &str) -> Self {
        match mode.split(',').next().unwrap_or_default().trim() {
            "S" => Self::Shared,
            "IS" => Self::IntentShared,
            "IX" => Self::IntentExclusive,
            "SIX" => Self::SharedIntentExclusive,
            _ => Self::Exclusive,
        }
    }
}

/// One observed lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub id: String,
    pub lock_type: LockType,
    pub mode: LockMode,
    pub mode_detail: String,
    pub session_id: SessionId,
    pub process_id: i64,
    pub object_name: String,
    pub object_type: String,
    pub schema_name: Option<String>,
    pub granted: bool,
    pub query: Option<String>,
    pub wait_start: Option<DateTime<Utc>>,
    /// Seconds spent waiting, when the backend reports it directly.
    pub wait_duration: Option<f64>,
    /// Sessions currently blocking this one (outgoing wait-for edges).
    pub blocked_by: Vec<SessionId>,
}

impl LockSnapshot {
    /// A relation lock on `object_name` with neutral defaults; collectors
    /// overwrite the remaining fields.
    pub fn new(
        session_id: impl Into<SessionId>,
        process_id: i64,
        object_name: impl Into<String>,
        granted: bool,
    ) -> Self {
        let session_id = session_id.into();
        let object_name = object_name.into();
        Self {
            id: format!("{session_id}:{object_name}"),
            lock_type: LockType::Relation,
            mode: LockMode::Exclusive,
            mode_detail: String::new(),
            session_id,
            process_id,
            object_name,
            object_type: "table".to_string(),
            schema_name: None,
            granted,
            query: None,
            wait_start: None,
            wait_duration: None,
            blocked_by: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_wait(mut self, seconds: f64) -> Self {
        self.wait_duration = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_wait_start(mut self, at: DateTime<Utc>) -> Self {
        self.wait_start = Some(at);
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema_name = Some(schema.into());
        self
    }

    #[must_use]
    pub fn blocked_by<I, S>(mut self, sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SessionId>,
    {
        self.blocked_by = sessions.into_iter().map(Into::into).collect();
        self
    }

    /// Seconds this lock has been waiting as of `now`. Granted locks and locks
    /// without timing information wait zero seconds.
    #[must_use]
    pub fn wait_seconds(&self, now: DateTime<Utc>) -> f64 {
        if self.granted {
            return 0.0;
        }

        if let Some(d) = self.wait_duration {
            return d.max(0.0);
        }

        self.wait_start.map_or(0.0, |start| {
            let millis = (now - start).num_milliseconds().max(0);
            crate::i64_to_f64(millis) / 1000.0
        })
    }

    /// `schema.object` when a schema is known, else the bare object name.
    #[must_use]
    pub fn qualified_object(&self) -> String {
        qualify(self.schema_name.as_deref(), &self.object_name)
    }
}

pub(crate) fn qualify(schema: Option<&str>, object: &str) -> String {
    match schema {
        Some(s) if !s.is_empty() => format!("{s}.{object}"),
        _ => object.to_string(),
    }
}

/// One session on a wait chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub session_id: SessionId,
    pub process_id: i64,
    pub query: Option<String>,
    /// Distance from the chain head (0 = head).
    pub depth: usize,
    /// Seconds this session has been waiting.
    pub wait_time: f64,
}

/// A path, or a collapsed cycle, through the wait-for graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitChain {
    pub id: String,
    pub nodes: Vec<ChainNode>,
    pub chain_length: usize,
    pub total_wait_time: f64,
    pub head_session: SessionId,
    pub tail_session: SessionId,
    pub is_cycle: bool,
    pub severity: Severity,
}

impl WaitChain {
    /// The tail's query text, truncated to `max_chars` for display.
    #[must_use]
    pub fn blocking_query(&self, max_chars: usize) -> Option<String> {
        let query = self.nodes.last()?.query.as_deref()?;
        Some(truncate_for_display(query, max_chars))
    }
}

/// Collapse whitespace and cut `text` to at most `max_chars` characters,
/// marking the cut with an ellipsis.
#[must_use]
pub fn truncate_for_display(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }

    let mut out: String = collapsed.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPattern {
    HotSpot,
    Burst,
    Frequent,
    TimeoutProne,
    Isolated,
}

impl ContentionPattern {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HotSpot => "hot_spot",
            Self::Burst => "burst",
            Self::Frequent => "frequent",
            Self::TimeoutProne => "timeout_prone",
            Self::Isolated => "isolated",
        }
    }
}

/// Aggregated contention on one database object for an analysis window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentionMetrics {
    pub object_name: String,
    pub object_type: String,
    pub schema_name: Option<String>,
    pub contention_count: u64,
    pub total_wait_time: f64,
    pub avg_wait_time: f64,
    pub max_wait_time: f64,
    pub pattern: ContentionPattern,
    pub affected_sessions: usize,
    pub affected_queries: usize,
    pub performance_impact: f64,
    pub priority: Severity,
    /// Up to three distinct queries seen waiting on the object.
    pub sample_queries: Vec<String>,
}

impl ContentionMetrics {
    #[must_use]
    pub fn qualified_name(&self) -> String {
        qualify(self.schema_name.as_deref(), &self.object_name)
    }
}

/// Average wait per contention event; zero when there were no events.
#[must_use]
pub fn average_wait(total_wait_time: f64, contention_count: u64) -> f64 {
    if contention_count == 0 {
        0.0
    } else {
        total_wait_time / crate::u64_to_f64(contention_count)
    }
}

/// Window-level lock aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockStatistics {
    pub window_secs: f64,
    pub total_locks: u64,
    pub waiting_locks: u64,
    pub granted_locks: u64,
    /// Deadlocks counted across the window; `None` until a sample at least
    /// one window old exists or when the server keeps no counter.
    pub deadlock_count: Option<u64>,
    pub timeout_count: Option<u64>,
    pub total_wait_time: f64,
    pub avg_wait_time: f64,
    pub max_wait_time: f64,
    pub lock_type_distribution: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

/// Overall health plus the sub-scores it was built from. A `None` sub-score
/// means its input was unavailable, not that it scored zero or 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: f64,
    pub status: HealthStatus,
    pub wait_time: Option<f64>,
    pub contention: Option<f64>,
    pub deadlock: Option<f64>,
    pub blocking_chain: Option<f64>,
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceType {
    Index,
    Query,
    Deadlock,
    Configuration,
}

impl AdviceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Query => "query",
            Self::Deadlock => "deadlock",
            Self::Configuration => "configuration",
        }
    }
}

/// One concrete remediation step, optionally with the statement to run and
/// the statement that undoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStep {
    pub description: String,
    pub statement: Option<String>,
    pub rollback: Option<String>,
}

impl ActionStep {
    pub fn note(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            statement: None,
            rollback: None,
        }
    }

    pub fn sql(
        description: impl Into<String>,
        statement: impl Into<String>,
        rollback: Option<String>,
    ) -> Self {
        Self {
            description: description.into(),
            statement: Some(statement.into()),
            rollback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationAdvice {
    pub id: String,
    pub advice_type: AdviceType,
    pub priority: Severity,
    pub title: String,
    pub description: String,
    pub target_object: Option<String>,
    pub impact_score: f64,
    pub estimated_improvement: String,
    pub steps: Vec<ActionStep>,
}

/// Something the result lacks, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataGap {
    Source { call: CollectionCall, reason: String },
    Analyzer { name: String, reason: String },
    Strategy { name: String, reason: String },
}

impl fmt::Display for DataGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source { call, reason } => write!(f, "source {call}: {reason}"),
            Self::Analyzer { name, reason } => write!(f, "analyzer {name}: {reason}"),
            Self::Strategy { name, reason } => write!(f, "strategy {name}: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness<'a> {
    Full,
    Partial { gaps: &'a [DataGap] },
}

/// Output of one comprehensive analysis. This is the unit that is cached and
/// returned to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_id: String,
    pub database_id: String,
    pub backend: String,
    pub window_secs: f64,
    pub analyzed_at: DateTime<Utc>,
    pub health_score: f64,
    pub health: HealthReport,
    pub statistics: Option<LockStatistics>,
    pub wait_chains: Vec<WaitChain>,
    pub contentions: Vec<ContentionMetrics>,
    pub advice: Vec<OptimizationAdvice>,
    pub gaps: Vec<DataGap>,
    /// Backend-specific metadata that does not fit the typed fields.
    pub diagnostics: BTreeMap<String, String>,
}

impl AnalysisResult {
    #[must_use]
    pub fn completeness(&self) -> Completeness<'_> {
        if self.gaps.is_empty() {
            Completeness::Full
        } else {
            Completeness::Partial { gaps: &self.gaps }
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Whether the given collection source is missing from this result.
    #[must_use]
    pub fn missing_source(&self, call: CollectionCall) -> bool {
        self.gaps
            .iter()
            .any(|g| matches!(g, DataGap::Source { call: c, .. } if *c == call))
    }

    #[must_use]
    pub fn deadlock_chains(&self) -> impl Iterator<Item = &WaitChain> {
        self.wait_chains.iter().filter(|c| c.is_cycle)
    }
}
