//! Per plan execution statistics.
//!
//! The counters of a plan live in one immutable [`Accumulator`] that is
//! replaced as a whole with a compare-and-swap loop, so concurrent
//! executions never block each other and a snapshot never mixes two
//! executions.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::error::Error;

/// Latency bucket boundaries in microseconds. Slower executions land in a
/// final overflow bucket.
const BUCKETS: [u64; 10] = [
    100,       // 100 microseconds
    500,       // 500 microseconds
    1_000,     // 1 millisecond
    5_000,     // 5 milliseconds
    10_000,    // 10 milliseconds
    50_000,    // 50 milliseconds
    100_000,   // 100 milliseconds
    500_000,   // 500 milliseconds
    1_000_000, // 1 second
    5_000_000, // 5 seconds
];

/// Upper bound reported for the overflow bucket.
pub const OVERFLOW_BUCKET: u64 = u64::MAX;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn bucket_index(micros: u64) -> usize {
    BUCKETS
        .iter()
        .position(|&boundary| micros <= boundary)
        .unwrap_or(BUCKETS.len())
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: u64,
    total_micros: u64,
    max_micros: u64,
    total_rows: u64,
    /// Microseconds since the Unix epoch, 0 when never executed.
    last_used: u64,
    buckets: [u64; BUCKETS.len() + 1],
}

impl Accumulator {
    fn with_execution(mut self, micros: u64, rows: u64, at: u64) -> Self {
        self.count += 1;
        self.total_micros = self.total_micros.saturating_add(micros);
        self.max_micros = self.max_micros.max(micros);
        self.total_rows = self.total_rows.saturating_add(rows);
        self.last_used = self.last_used.max(at);
        self.buckets[bucket_index(micros)] += 1;
        self
    }
}

/// Execution statistics accumulator of one query plan.
#[derive(Debug)]
pub struct PlanStatistics {
    state: ArcSwap<Accumulator>,
}

impl Default for PlanStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanStatistics {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(Accumulator::default()),
        }
    }

    /// Record one execution.
    pub fn record(&self, elapsed: Duration, rows: u64) {
        let micros = elapsed.as_micros() as u64;
        let at = now_micros();
        self.state.rcu(|current| current.with_execution(micros, rows, at));
    }

    /// Number of recorded executions.
    pub fn count(&self) -> u64 {
        self.state.load().count
    }

    /// Clear all counters. The plan itself is untouched.
    pub fn reset(&self) {
        self.state.store(Arc::new(Accumulator::default()));
    }

    /// Point in time copy of the counters.
    pub fn snapshot(&self, plan_id: &str, bean_type: &str, sql: &str) -> StatisticsSnapshot {
        let acc = **self.state.load();
        StatisticsSnapshot {
            plan_id: plan_id.to_string(),
            bean_type: bean_type.to_string(),
            sql: sql.to_string(),
            execution_count: acc.count,
            total_micros: acc.total_micros,
            mean_micros: if acc.count == 0 {
                0
            } else {
                acc.total_micros / acc.count
            },
            max_micros: acc.max_micros,
            total_rows: acc.total_rows,
            last_used_micros: acc.last_used,
            latency_buckets: BUCKETS
                .iter()
                .copied()
                .chain(std::iter::once(OVERFLOW_BUCKET))
                .zip(acc.buckets)
                .collect(),
        }
    }
}

/// Statistics of one plan at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub plan_id: String,
    pub bean_type: String,
    pub sql: String,
    pub execution_count: u64,
    pub total_micros: u64,
    pub mean_micros: u64,
    pub max_micros: u64,
    pub total_rows: u64,
    pub last_used_micros: u64,
    /// `(upper bound in microseconds, executions)` per latency bucket; the
    /// last bucket, bounded by [`OVERFLOW_BUCKET`], counts everything slower
    /// than five seconds.
    pub latency_buckets: Vec<(u64, u64)>,
}

impl StatisticsSnapshot {
    /// Render as JSON for monitoring endpoints.
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = PlanStatistics::new();
        stats.record(Duration::from_micros(50), 3);
        stats.record(Duration::from_micros(1_500), 7);

        let snap = stats.snapshot("abc", "Order", "select 1");
        assert_eq!(snap.execution_count, 2);
        assert_eq!(snap.total_micros, 1_550);
        assert_eq!(snap.mean_micros, 775);
        assert_eq!(snap.max_micros, 1_500);
        assert_eq!(snap.total_rows, 10);
        assert!(snap.last_used_micros > 0);
        assert_eq!(snap.latency_buckets[0], (100, 1));
        assert_eq!(snap.latency_buckets[3], (5_000, 1));
    }

    #[test]
    fn test_reset() {
        let stats = PlanStatistics::new();
        stats.record(Duration::from_millis(2), 1);
        stats.reset();
        let snap = stats.snapshot("abc", "Order", "select 1");
        assert_eq!(snap.execution_count, 0);
        assert_eq!(snap.max_micros, 0);
        assert_eq!(snap.mean_micros, 0);
        assert!(snap.latency_buckets.iter().all(|(_, c)| *c == 0));
    }

    #[test]
    fn test_slow_execution_counted_as_overflow() {
        let stats = PlanStatistics::new();
        stats.record(Duration::from_secs(5), 1);
        stats.record(Duration::from_secs(6), 1);
        let snap = stats.snapshot("abc", "Order", "");
        assert_eq!(snap.latency_buckets.len(), 11);
        assert_eq!(snap.latency_buckets[9], (5_000_000, 1));
        assert_eq!(snap.latency_buckets[10], (OVERFLOW_BUCKET, 1));
    }

    #[test]
    fn test_snapshot_is_consistent_under_concurrent_record() {
        let stats = std::sync::Arc::new(PlanStatistics::new());
        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observer = {
            let stats = stats.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    let snap = stats.snapshot("abc", "Order", "");
                    assert_eq!(snap.total_micros, snap.execution_count * 25);
                    assert_eq!(snap.total_rows, snap.execution_count * 2);
                    let bucketed: u64 = snap.latency_buckets.iter().map(|(_, c)| c).sum();
                    assert_eq!(bucketed, snap.execution_count);
                }
            })
        };
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        stats.record(Duration::from_micros(25), 2);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        observer.join().unwrap();
        assert_eq!(stats.count(), 2_000);
    }

    #[test]
    fn test_concurrent_record() {
        let stats = std::sync::Arc::new(PlanStatistics::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record(Duration::from_micros(10 * (i + 1)), 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = stats.snapshot("abc", "Order", "");
        assert_eq!(snap.execution_count, 1_000);
        assert_eq!(snap.total_rows, 1_000);
        assert_eq!(snap.max_micros, 40);
    }

    #[test]
    fn test_json() {
        let stats = PlanStatistics::new();
        stats.record(Duration::from_micros(10), 1);
        let json = stats.snapshot("abc", "Order", "select 1").to_json().unwrap();
        assert!(json.contains("\"execution_count\":1"));
        assert!(json.contains("\"plan_id\":\"abc\""));
    }
}
