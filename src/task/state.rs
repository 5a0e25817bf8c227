//! Task lifecycle states.
//!
//! The state graph permits only:
//!
//! ```text
//! New -> Queued -> Running -> Suspended -> Queued
//!                  Running -> Completed
//!                  Suspended -> Cancelled
//! ```
//!
//! `Completed` and `Cancelled` are terminal; transitions into them are
//! arbitrated with a strong CAS so that finish waiters are woken exactly
//! once. Any other arrival at a terminal state is ignored.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Sentinel for moved-out handles; never observed on a live task.
    Invalid = 0,
    /// Constructed, not yet scheduled.
    New = 1,
    /// Sitting in a processor's ready queue.
    Queued = 2,
    /// Executing on a worker thread.
    Running = 3,
    /// Parked on a wait list or a deadline.
    Suspended = 4,
    /// Ran its payload to completion (terminal).
    Completed = 5,
    /// Torn down without completing its payload (terminal).
    Cancelled = 6,
}

impl TaskState {
    /// Returns true for the two terminal states.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Human-readable state name, used by state-transition tracing.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::New => "New",
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }
}

fn from_u8(value: u8) -> TaskState {
    match value {
        1 => TaskState::New,
        2 => TaskState::Queued,
        3 => TaskState::Running,
        4 => TaskState::Suspended,
        5 => TaskState::Completed,
        6 => TaskState::Cancelled,
        v => {
            debug_assert!(false, "invalid TaskState value: {v}");
            TaskState::Invalid
        }
    }
}

/// Atomic cell holding a [`TaskState`].
#[derive(Debug)]
pub(crate) struct AtomicTaskState {
    inner: AtomicU8,
}

impl AtomicTaskState {
    pub(crate) fn new(state: TaskState) -> Self {
        Self {
            inner: AtomicU8::new(state as u8),
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> TaskState {
        from_u8(self.inner.load(order))
    }

    /// Plain store, for transitions whose synchronization point lives
    /// elsewhere (the ready-queue hand-off, the sleep-state RMW).
    pub(crate) fn store(&self, state: TaskState, order: Ordering) {
        self.inner.store(state as u8, order);
    }

    pub(crate) fn compare_exchange(
        &self,
        current: TaskState,
        new: TaskState,
    ) -> Result<TaskState, TaskState> {
        self.inner
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(from_u8)
            .map_err(from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminal_states_are_finished() {
        assert!(TaskState::Completed.is_finished());
        assert!(TaskState::Cancelled.is_finished());
        for state in [
            TaskState::New,
            TaskState::Queued,
            TaskState::Running,
            TaskState::Suspended,
        ] {
            assert!(!state.is_finished(), "{} must not be finished", state.name());
        }
    }

    #[test]
    fn cell_round_trips() {
        let cell = AtomicTaskState::new(TaskState::New);
        assert_eq!(cell.load(Ordering::SeqCst), TaskState::New);
        cell.store(TaskState::Queued, Ordering::SeqCst);
        assert_eq!(cell.load(Ordering::SeqCst), TaskState::Queued);
    }

    #[test]
    fn compare_exchange_arbitrates() {
        let cell = AtomicTaskState::new(TaskState::Suspended);
        assert!(cell
            .compare_exchange(TaskState::Suspended, TaskState::Cancelled)
            .is_ok());
        let err = cell
            .compare_exchange(TaskState::Suspended, TaskState::Queued)
            .unwrap_err();
        assert_eq!(err, TaskState::Cancelled);
    }
}
