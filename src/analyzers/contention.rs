//! Per-object contention aggregation and pattern classification.

use crate::model::{
    ContentionMetrics, ContentionPattern, LockSnapshot, Severity, average_wait,
};
use crate::policy::ContentionThresholds;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const MAX_SAMPLE_QUERIES: usize = 3;

/// Grouping key of one contended object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub object_type: String,
    pub object_name: String,
    pub schema_name: Option<String>,
}

impl ObjectKey {
    fn of_lock(lock: &LockSnapshot) -> Self {
        Self {
            object_type: lock.object_type.clone(),
            object_name: lock.object_name.clone(),
            schema_name: lock.schema_name.clone(),
        }
    }

    #[must_use]
    pub fn of_metrics(m: &ContentionMetrics) -> Self {
        Self {
            object_type: m.object_type.clone(),
            object_name: m.object_name.clone(),
            schema_name: m.schema_name.clone(),
        }
    }
}

/// How many earlier analysis windows each object showed contention in.
#[derive(Debug, Clone, Default)]
pub struct ContentionHistory {
    windows: HashMap<ObjectKey, u32>,
}

impl ContentionHistory {
    #[must_use]
    pub fn windows_seen(&self, key: &ObjectKey) -> u32 {
        self.windows.get(key).copied().unwrap_or(0)
    }

    /// Count one more window for every object in `contentions`.
    pub fn record(&mut self, contentions: &[ContentionMetrics]) {
        for m in contentions {
            let seen = self.windows.entry(ObjectKey::of_metrics(m)).or_default();
            *seen = seen.saturating_add(1);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[derive(Default)]
struct Group<'a> {
    // Age in seconds of each waiting lock, i.e. how long ago its wait began.
    ages: Vec<f64>,
    sessions: BTreeSet<&'a str>,
    queries: BTreeSet<&'a str>,
    samples: Vec<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentionAnalyzer {
    thresholds: ContentionThresholds,
}

impl ContentionAnalyzer {
    #[must_use]
    pub const fn new(thresholds: ContentionThresholds) -> Self {
        Self { thresholds }
    }

    /// Aggregate waiting locks per object. Objects with only granted locks
    /// are not contended and produce no entry. Output is ordered by impact
    /// descending, then by object identity.
    #[must_use]
    pub fn analyze(
        &self,
        locks: &[LockSnapshot],
        history: &ContentionHistory,
        now: DateTime<Utc>,
    ) -> Vec<ContentionMetrics> {
        let mut groups: BTreeMap<ObjectKey, Group<'_>> = BTreeMap::new();

        for lock in locks.iter().filter(|l| !l.granted) {
            let group = groups.entry(ObjectKey::of_lock(lock)).or_default();
            group.ages.push(lock.wait_seconds(now));
            group.sessions.insert(lock.session_id.as_str());

            if let Some(query) = lock.query.as_deref() {
                if group.queries.insert(query) && group.samples.len() < MAX_SAMPLE_QUERIES {
                    group.samples.push(query);
                }
            }
        }

        let mut out: Vec<ContentionMetrics> = groups
            .into_iter()
            .map(|(key, group)| self.metrics_for(key, &group, history))
            .collect();

        out.sort_by(|a, b| {
            b.performance_impact
                .total_cmp(&a.performance_impact)
                .then_with(|| a.qualified_name().cmp(&b.qualified_name()))
                .then_with(|| a.object_type.cmp(&b.object_type))
        });

        out
    }

    fn metrics_for(
        &self,
        key: ObjectKey,
        group: &Group<'_>,
        history: &ContentionHistory,
    ) -> ContentionMetrics {
        let contention_count = group.ages.len() as u64;
        let total_wait_time: f64 = group.ages.iter().sum();
        let max_wait_time = group.ages.iter().copied().fold(0.0, f64::max);
        let pattern = self.classify(&group.ages, history.windows_seen(&key));
        let performance_impact = self.performance_impact(contention_count, total_wait_time);

        ContentionMetrics {
            object_name: key.object_name,
            object_type: key.object_type,
            schema_name: key.schema_name,
            contention_count,
            total_wait_time,
            avg_wait_time: average_wait(total_wait_time, contention_count),
            max_wait_time,
            pattern,
            affected_sessions: group.sessions.len(),
            affected_queries: group.queries.len(),
            performance_impact,
            priority: self.priority(performance_impact),
            sample_queries: group.samples.iter().map(|q| (*q).to_string()).collect(),
        }
    }

    /// First matching pattern wins: hot spot, burst, frequent, timeout
    /// prone, isolated.
    fn classify(&self, ages: &[f64], prior_windows: u32) -> ContentionPattern {
        let t = &self.thresholds;
        let count = ages.len() as u64;

        let oldest = ages.iter().copied().fold(f64::MIN, f64::max);
        let newest = ages.iter().copied().fold(f64::MAX, f64::min);
        let span = if ages.is_empty() { 0.0 } else { oldest - newest };

        if count >= t.hot_spot_min_events && span <= t.hot_spot_window_secs {
            return ContentionPattern::HotSpot;
        }

        if count >= t.burst_min_events && densest_interval(ages, t.burst_interval_secs) * 2 > ages.len() {
            return ContentionPattern::Burst;
        }

        if prior_windows >= t.frequent_min_windows {
            return ContentionPattern::Frequent;
        }

        let near_ceiling = t.timeout_ceiling_secs * t.timeout_near_ratio;
        let near = ages.iter().filter(|w| **w >= near_ceiling).count();
        if !ages.is_empty() && crate::u64_to_f64(near as u64) >= t.timeout_prone_share * crate::u64_to_f64(count) {
            return ContentionPattern::TimeoutProne;
        }

        ContentionPattern::Isolated
    }

    /// Logarithmic blend of event count and total wait, each half saturating
    /// at the hot-spot minimum and the wait ceiling respectively.
    #[must_use]
    pub fn performance_impact(&self, contention_count: u64, total_wait_time: f64) -> f64 {
        let t = &self.thresholds;
        let count_scale = (1.0 + crate::u64_to_f64(t.hot_spot_min_events)).ln();
        let wait_scale = (1.0 + t.impact_wait_ceiling_secs).ln();

        let count_part = ((1.0 + crate::u64_to_f64(contention_count)).ln() / count_scale).min(1.0);
        let wait_part = ((1.0 + total_wait_time.max(0.0)).ln() / wait_scale).min(1.0);

        (50.0 * count_part + 50.0 * wait_part).clamp(0.0, 100.0)
    }

    #[must_use]
    pub fn priority(&self, impact: f64) -> Severity {
        let t = &self.thresholds;
        if impact >= t.critical_impact {
            Severity::Critical
        } else if impact >= t.high_impact {
            Severity::High
        } else if impact >= t.medium_impact {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

// Largest number of wait starts falling inside any interval of `width`
// seconds.
fn densest_interval(ages: &[f64], width: f64) -> usize {
    let mut sorted = ages.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut best = 0;
    let mut lo = 0;
    for (hi, age) in sorted.iter().enumerate() {
        while sorted.get(lo).is_some_and(|start| age - start > width) {
            lo += 1;
        }
        best = best.max(hi + 1 - lo);
    }
    best
}
