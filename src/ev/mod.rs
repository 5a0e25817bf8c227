//! Event thread pool.
//!
//! A small fixed set of threads, each running a timer event loop. The task
//! runtime uses them for deadline-driven wakeups; callbacks run on the event
//! thread and must not block.

pub mod timer;

pub use timer::Timer;

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// An armed one-shot timer entry.
struct TimerEntry {
    deadline: Instant,
    generation: u64,
    cancelled: Arc<AtomicBool>,
    callback: Box<dyn FnOnce() + Send + 'static>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for a min-heap; generation breaks deadline ties.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct LoopState {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
    shutdown: bool,
}

/// Shared state of one event thread.
pub struct EventThread {
    state: Mutex<LoopState>,
    condvar: Condvar,
}

impl std::fmt::Debug for EventThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventThread")
            .field("armed", &self.state.lock().heap.len())
            .finish_non_exhaustive()
    }
}

impl EventThread {
    fn arm(
        &self,
        deadline: Instant,
        cancelled: Arc<AtomicBool>,
        callback: Box<dyn FnOnce() + Send + 'static>,
    ) {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        state.heap.push(TimerEntry {
            deadline,
            generation,
            cancelled,
            callback,
        });
        self.condvar.notify_one();
    }

    fn event_loop(&self) {
        loop {
            let mut due = Vec::new();
            {
                let mut state = self.state.lock();
                loop {
                    let now = Instant::now();
                    while state
                        .heap
                        .peek()
                        .is_some_and(|entry| entry.deadline <= now)
                    {
                        due.push(state.heap.pop().expect("peeked entry vanished"));
                    }
                    if !due.is_empty() {
                        break;
                    }
                    if state.shutdown {
                        // Pending entries never fire; drop them now so the
                        // task contexts they capture are released.
                        state.heap.clear();
                        return;
                    }
                    match state.heap.peek().map(|entry| entry.deadline) {
                        Some(next) => {
                            let timeout = next.saturating_duration_since(now);
                            let _ = self.condvar.wait_for(&mut state, timeout);
                        }
                        None => self.condvar.wait(&mut state),
                    }
                }
            }
            // Callbacks run outside the heap lock.
            for entry in due {
                if !entry.cancelled.load(Ordering::Acquire) {
                    (entry.callback)();
                }
            }
        }
    }
}

/// A small fixed pool of event threads.
#[derive(Debug)]
pub struct EventThreadPool {
    threads: Vec<Arc<EventThread>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl EventThreadPool {
    /// Starts `count` event threads (at least one).
    #[must_use]
    pub fn new(count: usize, thread_name_prefix: &str) -> Self {
        let count = count.max(1);
        let mut threads = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for index in 0..count {
            let thread = Arc::new(EventThread {
                state: Mutex::new(LoopState::default()),
                condvar: Condvar::new(),
            });
            let worker = Arc::clone(&thread);
            let join = std::thread::Builder::new()
                .name(format!("{thread_name_prefix}-ev-{index}"))
                .spawn(move || worker.event_loop())
                .expect("failed to spawn event thread");
            threads.push(thread);
            joins.push(join);
        }
        Self {
            threads,
            joins: Mutex::new(joins),
            next: AtomicUsize::new(0),
        }
    }

    /// Picks an event thread round-robin.
    #[must_use]
    pub fn next_thread(&self) -> Arc<EventThread> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        Arc::clone(&self.threads[index])
    }

    /// Stops and joins the event threads, dropping any armed timers.
    /// Idempotent.
    pub(crate) fn shutdown(&self) {
        for thread in &self.threads {
            thread.state.lock().shutdown = true;
            thread.condvar.notify_one();
        }
        for join in self.joins.lock().drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for EventThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn next_thread_round_robins() {
        let pool = EventThreadPool::new(3, "test");
        let a = pool.next_thread();
        let b = pool.next_thread();
        let c = pool.next_thread();
        let again = pool.next_thread();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn callbacks_fire_in_deadline_order() {
        let pool = EventThreadPool::new(1, "test");
        let thread = pool.next_thread();
        let order = Arc::new(Mutex::new(Vec::new()));
        let fired = Arc::new(AtomicU32::new(0));
        for (tag, delay_ms) in [(2u32, 40u64), (1, 10)] {
            let order = Arc::clone(&order);
            let fired = Arc::clone(&fired);
            thread.arm(
                Instant::now() + Duration::from_millis(delay_ms),
                Arc::new(AtomicBool::new(false)),
                Box::new(move || {
                    order.lock().push(tag);
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn shutdown_joins_event_threads() {
        let pool = EventThreadPool::new(2, "test");
        drop(pool);
    }
}
