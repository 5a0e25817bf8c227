//! Single-consumer wake event.
//!
//! An auto-reset event for exactly one waiting task at a time: `send` makes
//! it signaled and wakes the waiter, a successful wait consumes the signal.
//! This is the signalling discipline of the single-producer / single-consumer
//! queue sides.

use crate::sync::{WaitList, WaitStrategy};
use crate::task::current;
use crate::task::context::TaskContext;
use crate::task::WakeupSource;
use crate::time::Deadline;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An auto-reset event with at most one waiting task.
#[derive(Debug, Default)]
pub struct SingleConsumerEvent {
    signaled: AtomicBool,
    waiters: WaitList,
}

impl SingleConsumerEvent {
    /// Creates an event in the non-signaled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the event signaled and wakes the waiter, if any.
    ///
    /// Callable from anywhere, including timer callbacks.
    pub fn send(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        self.waiters.lock().wake_one();
    }

    /// Clears a pending signal without waking anyone.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::SeqCst);
    }

    /// True if a signal is pending.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Waits until the event is signaled, consuming the signal.
    ///
    /// Must run inside a task. Returns false when the deadline expires, or
    /// when the task is cancel-requested, with no signal pending; a signal
    /// racing either of those still wins.
    pub fn wait_until(&self, deadline: Deadline) -> bool {
        let current = current::context();
        loop {
            if self.signaled.swap(false, Ordering::SeqCst) {
                return true;
            }
            let strategy = EventWaitStrategy {
                event: self,
                deadline,
                current: Arc::clone(&current),
            };
            current.sleep(&strategy);
            match current.wakeup_source() {
                WakeupSource::WaitList | WakeupSource::Bootstrap => {}
                WakeupSource::DeadlineTimer | WakeupSource::CancelRequest => {
                    return self.signaled.swap(false, Ordering::SeqCst);
                }
                WakeupSource::None => unreachable!("resumed with no wakeup source"),
            }
        }
    }
}

/// Registers the waiter after it parked; re-checks the signal under the list
/// lock so a send racing the park is not lost.
struct EventWaitStrategy<'a> {
    event: &'a SingleConsumerEvent,
    deadline: Deadline,
    current: Arc<TaskContext>,
}

impl WaitStrategy for EventWaitStrategy<'_> {
    fn deadline(&self) -> Deadline {
        self.deadline
    }

    fn after_asleep(&self) {
        let mut guard = self.event.waiters.lock();
        guard.append(Arc::clone(&self.current));
        if self.event.signaled.load(Ordering::SeqCst) {
            guard.wake_one();
        }
    }

    fn before_awake(&self) {}

    fn wait_list(&self) -> Option<&WaitList> {
        Some(&self.event.waiters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_reset_clears_the_signal() {
        let event = SingleConsumerEvent::new();
        assert!(!event.is_signaled());
        event.send();
        assert!(event.is_signaled());
        event.reset();
        assert!(!event.is_signaled());
    }

    #[test]
    fn send_is_idempotent_until_consumed() {
        let event = SingleConsumerEvent::new();
        event.send();
        event.send();
        assert!(event.is_signaled());
    }
}
