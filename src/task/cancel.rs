//! Cancellation reasons.
//!
//! Cancellation is cooperative and first-class: a reason is latched exactly
//! once per task and the task observes it at its next suspension point.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why a task was asked to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CancelReason {
    /// Explicit cancellation requested by user code.
    UserRequest = 1,
    /// The task was shed due to processor overload.
    Overload = 2,
    /// The runtime is shutting down.
    Shutdown = 3,
    /// The owning handle was dropped without waiting for the task.
    Abandoned = 4,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserRequest => write!(f, "user request"),
            Self::Overload => write!(f, "overload"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Write-once cell holding an optional [`CancelReason`].
///
/// The transition from "no reason" to a concrete reason happens at most once
/// over the life of a task; later requests lose the race and are ignored.
#[derive(Debug, Default)]
pub(crate) struct AtomicCancelReason {
    inner: AtomicU8,
}

const NONE: u8 = 0;

impl AtomicCancelReason {
    pub(crate) const fn new() -> Self {
        Self {
            inner: AtomicU8::new(NONE),
        }
    }

    /// Latches `reason` if no reason is set yet. Returns true on the winning
    /// call.
    pub(crate) fn try_set(&self, reason: CancelReason) -> bool {
        self.inner
            .compare_exchange(NONE, reason as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn get(&self) -> Option<CancelReason> {
        match self.inner.load(Ordering::SeqCst) {
            NONE => None,
            1 => Some(CancelReason::UserRequest),
            2 => Some(CancelReason::Overload),
            3 => Some(CancelReason::Shutdown),
            4 => Some(CancelReason::Abandoned),
            value => {
                debug_assert!(false, "invalid CancelReason value: {value}");
                Some(CancelReason::UserRequest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let cell = AtomicCancelReason::new();
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn first_reason_wins() {
        let cell = AtomicCancelReason::new();
        assert!(cell.try_set(CancelReason::Shutdown));
        assert!(!cell.try_set(CancelReason::UserRequest));
        assert_eq!(cell.get(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn racing_writers_latch_exactly_one_reason() {
        use std::sync::Arc;

        let cell = Arc::new(AtomicCancelReason::new());
        let mut handles = Vec::new();
        for reason in [
            CancelReason::UserRequest,
            CancelReason::Overload,
            CancelReason::Shutdown,
            CancelReason::Abandoned,
        ] {
            let cell = Arc::clone(&cell);
            handles.push(std::thread::spawn(move || cell.try_set(reason)));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("writer panicked"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(cell.get().is_some());
    }
}
