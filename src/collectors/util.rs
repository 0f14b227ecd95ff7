//! Helpers shared by the backend collectors:
//! - Windowed increases of monotonically increasing server counters.
//! - Assembly of window statistics from per-backend query results.

use crate::model::{LockStatistics, average_wait};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Samples kept per counter; at one analysis a minute this covers twelve
/// hours.
pub const MAX_COUNTER_SAMPLES: usize = 720;

#[derive(Debug, Clone, Copy)]
struct CounterSample {
    at: Instant,
    value: i64,
}

/// Timestamped readings of a cumulative server counter (deadlocks, lock
/// timeouts), so the increase over any trailing window can be read back.
///
/// A counter that went backwards (stats reset, server restart) drops the
/// older readings.
#[derive(Debug, Default)]
pub struct CounterWindow {
    samples: Mutex<VecDeque<CounterSample>>,
}

impl CounterWindow {
    /// Record `value` read at `at` and return its increase since the newest
    /// earlier reading taken at or before `at - window`. `None` when no
    /// reading is that old yet.
    pub fn observe(&self, value: i64, at: Instant, window: Duration) -> Option<u64> {
        let mut samples = self.samples.lock();

        if samples.back().is_some_and(|last| value < last.value) {
            samples.clear();
        }

        let base = at.checked_sub(window).and_then(|cutoff| {
            samples
                .iter()
                .rev()
                .find(|s| s.at <= cutoff)
                .map(|s| s.value)
        });

        samples.push_back(CounterSample { at, value });
        while samples.len() > MAX_COUNTER_SAMPLES {
            samples.pop_front();
        }

        base.map(|base| u64::try_from(value.saturating_sub(base)).unwrap_or(0))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Feed an optional counter reading into `counter`. A missing reading
/// (counter not exposed by the server) leaves the count unknown.
pub fn windowed_count(
    counter: &CounterWindow,
    reading: Option<i64>,
    at: Instant,
    window: Duration,
) -> Option<u64> {
    reading.and_then(|value| counter.observe(value, at, window))
}

/// Non-negative count from a SQL `COUNT`/counter column; NULL is zero.
#[must_use]
pub fn count_column(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

/// Wait aggregates computed by the backend over currently waiting locks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WaitTotals {
    pub waiting: u64,
    pub total_secs: f64,
    pub max_secs: f64,
}

/// One `(lock type, granted, count)` row of a lock census.
pub type LockCount = (String, bool, u64);

#[must_use]
pub fn assemble_statistics(
    window: Duration,
    census: &[LockCount],
    waits: WaitTotals,
    deadlock_count: Option<u64>,
    timeout_count: Option<u64>,
) -> LockStatistics {
    let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
    let mut granted_locks = 0;
    let mut waiting_locks = 0;

    for (lock_type, granted, count) in census {
        *distribution.entry(lock_type.clone()).or_default() += count;
        if *granted {
            granted_locks += count;
        } else {
            waiting_locks += count;
        }
    }

    let total_wait_time = waits.total_secs.max(0.0);

    LockStatistics {
        window_secs: window.as_secs_f64(),
        total_locks: granted_locks + waiting_locks,
        waiting_locks,
        granted_locks,
        deadlock_count,
        timeout_count,
        total_wait_time,
        avg_wait_time: average_wait(total_wait_time, waits.waiting),
        max_wait_time: waits.max_secs.max(0.0),
        lock_type_distribution: distribution,
    }
}

/// Clamp a character limit into the `INT` range SQL `LEFT()` accepts.
#[must_use]
pub fn sql_text_limit(limit: usize) -> i32 {
    i32::try_from(limit).unwrap_or(i32::MAX).max(1)
}
