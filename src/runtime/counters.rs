//! Task accounting.
//!
//! Monotonic counters plus a log-scale execution-time histogram, fed by the
//! per-step profiler timing. All updates are relaxed atomics; readers get a
//! consistent-enough snapshot for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bucket upper bounds for the execution-time histogram, in microseconds.
const EXECUTION_BUCKETS_US: [u64; 8] = [10, 100, 500, 1_000, 5_000, 10_000, 100_000, 1_000_000];

/// Per-processor task accounting.
#[derive(Debug, Default)]
pub struct TaskCounter {
    created: AtomicU64,
    destroyed: AtomicU64,
    cancelled: AtomicU64,
    completed: AtomicU64,
    execution_buckets: [AtomicU64; EXECUTION_BUCKETS_US.len() + 1],
    execution_total_us: AtomicU64,
}

impl TaskCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tasks created over the processor's lifetime.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Task contexts already destroyed.
    #[must_use]
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Cancellation requests that latched a reason.
    #[must_use]
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Tasks that ran their payload to completion.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Histogram of single-step execution times: bucket upper bounds in
    /// microseconds paired with counts; the final entry is the overflow
    /// bucket (`None` bound).
    #[must_use]
    pub fn execution_time_histogram(&self) -> Vec<(Option<u64>, u64)> {
        let mut buckets: Vec<(Option<u64>, u64)> = EXECUTION_BUCKETS_US
            .iter()
            .enumerate()
            .map(|(i, bound)| (Some(*bound), self.execution_buckets[i].load(Ordering::Relaxed)))
            .collect();
        buckets.push((
            None,
            self.execution_buckets[EXECUTION_BUCKETS_US.len()].load(Ordering::Relaxed),
        ));
        buckets
    }

    /// Total time spent in task steps.
    #[must_use]
    pub fn execution_time_total(&self) -> Duration {
        Duration::from_micros(self.execution_total_us.load(Ordering::Relaxed))
    }

    pub(crate) fn account_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_execution(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let index = EXECUTION_BUCKETS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(EXECUTION_BUCKETS_US.len());
        self.execution_buckets[index].fetch_add(1, Ordering::Relaxed);
        self.execution_total_us.fetch_add(us, Ordering::Relaxed);
    }
}

/// Accounts one task's create/destroy pair.
///
/// Shares ownership of the counter, so the accounting outlives the
/// processor that created it and may be dropped in any order relative to it.
#[derive(Debug)]
pub(crate) struct CounterToken {
    counter: Arc<TaskCounter>,
}

impl CounterToken {
    pub(crate) fn new(counter: Arc<TaskCounter>) -> Self {
        counter.created.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }

    pub(crate) fn counter(&self) -> &TaskCounter {
        &self.counter
    }
}

impl Drop for CounterToken {
    fn drop(&mut self) {
        self.counter.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_accounts_create_and_destroy() {
        let counter = Arc::new(TaskCounter::new());
        let token = CounterToken::new(Arc::clone(&counter));
        assert_eq!(counter.created(), 1);
        assert_eq!(counter.destroyed(), 0);
        drop(token);
        assert_eq!(counter.destroyed(), 1);
    }

    #[test]
    fn token_outlives_every_other_counter_reference() {
        let counter = Arc::new(TaskCounter::new());
        let token = CounterToken::new(Arc::clone(&counter));
        drop(counter);
        assert_eq!(token.counter().created(), 1);
        drop(token);
    }

    #[test]
    fn execution_times_land_in_the_right_bucket() {
        let counter = TaskCounter::new();
        counter.account_execution(Duration::from_micros(5));
        counter.account_execution(Duration::from_micros(700));
        counter.account_execution(Duration::from_secs(10));
        let histogram = counter.execution_time_histogram();
        assert_eq!(histogram[0], (Some(10), 1));
        assert_eq!(histogram[3], (Some(1_000), 1));
        assert_eq!(histogram.last().copied(), Some((None, 1)));
        assert!(counter.execution_time_total() >= Duration::from_secs(10));
    }
}
