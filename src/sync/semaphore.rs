//! Deadline-aware counting semaphore.
//!
//! The signalling discipline of the multi-producer / multi-consumer queue
//! sides. Permit counts range up to `usize::MAX / 2` plus a queue capacity,
//! which is what the end-of-stream unlock mechanism relies on.

use crate::sync::{WaitList, WaitStrategy};
use crate::task::current;
use crate::task::context::TaskContext;
use crate::task::WakeupSource;
use crate::time::Deadline;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A counting semaphore whose blocking acquire parks the current task.
#[derive(Debug)]
pub struct Semaphore {
    permits: AtomicUsize,
    waiters: WaitList,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
            waiters: WaitList::new(),
        }
    }

    /// Acquires `count` permits if immediately available.
    pub fn try_acquire(&self, count: usize) -> bool {
        let mut available = self.permits.load(Ordering::SeqCst);
        loop {
            if available < count {
                return false;
            }
            match self.permits.compare_exchange_weak(
                available,
                available - count,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(now) => available = now,
            }
        }
    }

    /// Acquires `count` permits, parking the current task until they are
    /// available or `deadline` expires.
    ///
    /// The fast path never suspends, so uncontended acquires work from any
    /// thread; the slow path must run inside a task. Returns false on
    /// deadline expiry or when the current task is cancel-requested.
    pub fn acquire_until(&self, deadline: Deadline, count: usize) -> bool {
        if self.try_acquire(count) {
            return true;
        }
        let current = current::context();
        loop {
            let strategy = SemaphoreWaitStrategy {
                semaphore: self,
                deadline,
                count,
                current: Arc::clone(&current),
            };
            current.sleep(&strategy);
            if self.try_acquire(count) {
                return true;
            }
            match current.wakeup_source() {
                WakeupSource::WaitList | WakeupSource::Bootstrap => {}
                WakeupSource::DeadlineTimer | WakeupSource::CancelRequest => return false,
                WakeupSource::None => unreachable!("resumed with no wakeup source"),
            }
        }
    }

    /// Returns `count` permits and wakes parked waiters.
    pub fn release(&self, count: usize) {
        self.permits.fetch_add(count, Ordering::SeqCst);
        // Waiters retry and re-park if their demand still is not covered.
        self.waiters.lock().wake_all();
    }

    /// Approximate number of available permits.
    #[must_use]
    pub fn remaining_approx(&self) -> usize {
        self.permits.load(Ordering::SeqCst)
    }
}

struct SemaphoreWaitStrategy<'a> {
    semaphore: &'a Semaphore,
    deadline: Deadline,
    count: usize,
    current: Arc<TaskContext>,
}

impl WaitStrategy for SemaphoreWaitStrategy<'_> {
    fn deadline(&self) -> Deadline {
        self.deadline
    }

    fn after_asleep(&self) {
        let mut guard = self.semaphore.waiters.lock();
        guard.append(Arc::clone(&self.current));
        // A release between the failed fast path and the park would be lost
        // without this re-check.
        if self.semaphore.permits.load(Ordering::SeqCst) >= self.count {
            guard.wake_all();
        }
    }

    fn before_awake(&self) {}

    fn wait_list(&self) -> Option<&WaitList> {
        Some(&self.semaphore.waiters)
    }
}
