//! Completion-attempt accounting for the reactor.
//!
//! Every pending operation carries an attempt counter: the number of
//! not-ready polls it survived before completing. Completions are bucketed
//! into a per-category histogram so the cost of polling (as opposed to
//! waiting on readiness notification) stays observable in-process.

use parking_lot::Mutex;

/// Number of histogram buckets per category. The last bucket aggregates
/// every attempt count at or above `HISTOGRAM_BUCKETS - 1`.
pub const HISTOGRAM_BUCKETS: usize = 1024;

/// The kind of I/O a pending operation represents.
///
/// Categories only affect statistics; the reactor treats all pending
/// operations identically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCategory {
    /// Accepting an inbound connection.
    Accept,
    /// Establishing an outbound connection.
    Connect,
    /// Reading from a socket.
    Read,
    /// Writing to a socket.
    Write,
}

impl OpCategory {
    /// All categories, in histogram index order.
    pub const ALL: [OpCategory; 4] = [
        OpCategory::Accept,
        OpCategory::Connect,
        OpCategory::Read,
        OpCategory::Write,
    ];

    fn index(self) -> usize {
        match self {
            Self::Accept => 0,
            Self::Connect => 1,
            Self::Read => 2,
            Self::Write => 3,
        }
    }
}

impl std::fmt::Display for OpCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Connect => write!(f, "connect"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Aggregate over the attempt counts of completed operations that were
/// not ready on at least one pass.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AttemptAggregate {
    /// Smallest observed attempt count.
    pub min: u64,
    /// Largest observed attempt count.
    pub max: u64,
    /// Mean attempt count across samples.
    pub mean: f64,
    /// Number of completions that contributed.
    pub samples: u64,
}

/// A point-in-time snapshot of reactor accounting.
#[derive(Clone, Debug)]
pub struct ReactorStats {
    /// Total operations completed since the reactor was created.
    pub ops_completed: u64,
    /// Operations dropped because their `try_complete` panicked.
    pub ops_dropped: u64,
    /// Operations completed per worker thread.
    pub ops_per_thread: Vec<u64>,
    /// Aggregate over attempt counts of operations that needed more than
    /// one pass.
    pub failure_attempts: AttemptAggregate,
    histograms: Vec<Vec<u64>>,
}

impl ReactorStats {
    /// The attempt-count histogram for one category.
    ///
    /// Bucket `i` holds the number of operations that completed after
    /// exactly `i` not-ready passes; the final bucket aggregates overflow.
    pub fn histogram(&self, category: OpCategory) -> &[u64] {
        &self.histograms[category.index()]
    }
}

struct StatsState {
    ops_completed: u64,
    ops_dropped: u64,
    ops_per_thread: Vec<u64>,
    failure_min: u64,
    failure_max: u64,
    failure_sum: u64,
    failure_samples: u64,
    histograms: Vec<Vec<u64>>,
}

/// Shared accounting updated by worker threads on completion only, so a
/// single mutex is enough.
pub(crate) struct CompletionStats {
    state: Mutex<StatsState>,
}

impl CompletionStats {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(StatsState {
                ops_completed: 0,
                ops_dropped: 0,
                ops_per_thread: Vec::new(),
                failure_min: 0,
                failure_max: 0,
                failure_sum: 0,
                failure_samples: 0,
                histograms: OpCategory::ALL
                    .iter()
                    .map(|_| vec![0u64; HISTOGRAM_BUCKETS])
                    .collect(),
            }),
        }
    }

    pub(crate) fn ensure_thread_slots(&self, threads: usize) {
        let mut state = self.state.lock();
        if state.ops_per_thread.len() < threads {
            state.ops_per_thread.resize(threads, 0);
        }
    }

    pub(crate) fn record_completion(&self, category: OpCategory, attempts: u32, thread: usize) {
        let mut state = self.state.lock();
        state.ops_completed += 1;
        if let Some(count) = state.ops_per_thread.get_mut(thread) {
            *count += 1;
        }
        let bucket = (attempts as usize).min(HISTOGRAM_BUCKETS - 1);
        state.histograms[category.index()][bucket] += 1;
        if attempts > 0 {
            let attempts = u64::from(attempts);
            if state.failure_samples == 0 || attempts < state.failure_min {
                state.failure_min = attempts;
            }
            if attempts > state.failure_max {
                state.failure_max = attempts;
            }
            state.failure_sum += attempts;
            state.failure_samples += 1;
        }
    }

    pub(crate) fn record_dropped(&self) {
        self.state.lock().ops_dropped += 1;
    }

    pub(crate) fn snapshot(&self) -> ReactorStats {
        let state = self.state.lock();
        let mean = if state.failure_samples == 0 {
            0.0
        } else {
            state.failure_sum as f64 / state.failure_samples as f64
        };
        ReactorStats {
            ops_completed: state.ops_completed,
            ops_dropped: state.ops_dropped,
            ops_per_thread: state.ops_per_thread.clone(),
            failure_attempts: AttemptAggregate {
                min: state.failure_min,
                max: state.failure_max,
                mean,
                samples: state.failure_samples,
            },
            histograms: state.histograms.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_counts_accumulate() {
        let stats = CompletionStats::new();
        stats.ensure_thread_slots(2);
        stats.record_completion(OpCategory::Read, 0, 0);
        stats.record_completion(OpCategory::Read, 3, 1);
        stats.record_completion(OpCategory::Write, 5, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.ops_completed, 3);
        assert_eq!(snap.ops_per_thread, vec![1, 2]);
        assert_eq!(snap.histogram(OpCategory::Read)[0], 1);
        assert_eq!(snap.histogram(OpCategory::Read)[3], 1);
        assert_eq!(snap.histogram(OpCategory::Write)[5], 1);
    }

    #[test]
    fn failure_aggregate_skips_immediate_completions() {
        let stats = CompletionStats::new();
        stats.ensure_thread_slots(1);
        stats.record_completion(OpCategory::Connect, 0, 0);
        stats.record_completion(OpCategory::Connect, 2, 0);
        stats.record_completion(OpCategory::Connect, 6, 0);

        let agg = stats.snapshot().failure_attempts;
        assert_eq!(agg.samples, 2);
        assert_eq!(agg.min, 2);
        assert_eq!(agg.max, 6);
        assert!((agg.mean - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn overflow_attempts_land_in_last_bucket() {
        let stats = CompletionStats::new();
        stats.ensure_thread_slots(1);
        stats.record_completion(OpCategory::Accept, 5000, 0);

        let snap = stats.snapshot();
        assert_eq!(snap.histogram(OpCategory::Accept)[HISTOGRAM_BUCKETS - 1], 1);
    }
}
