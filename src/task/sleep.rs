//! Sleep-state bitset and wakeup-source arbitration.
//!
//! While a task is parked, concurrent wakers race on a single atomic word:
//! each sets its source bit with a seq_cst `fetch_or` and the
//! [`should_schedule`] predicate lets exactly one of them reschedule the
//! task. On resumption the accumulated bits are resolved into one
//! [`WakeupSource`] by fixed priority.

use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) mod flags {
    //! Bits of the sleep-state word.

    /// Set strictly between the task yielding with a waiting reason and the
    /// next worker dequeuing it.
    pub const SLEEPING: usize = 1 << 0;
    /// The task parked inside a non-cancellable region; cancel wakeups are
    /// suppressed while set.
    pub const NON_CANCELLABLE: usize = 1 << 1;
    pub const WAKEUP_BY_WAIT_LIST: usize = 1 << 2;
    pub const WAKEUP_BY_DEADLINE_TIMER: usize = 1 << 3;
    pub const WAKEUP_BY_CANCEL_REQUEST: usize = 1 << 4;
    pub const WAKEUP_BY_BOOTSTRAP: usize = 1 << 5;
}

/// The resolved cause of a task's last awakening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeupSource {
    /// The task has not been awakened yet.
    None,
    /// A wait list the task was parked on woke it.
    WaitList,
    /// The deadline timer armed for the sleep fired.
    DeadlineTimer,
    /// First scheduling of a freshly attached coroutine frame.
    Bootstrap,
    /// A cancellation request woke the task.
    CancelRequest,
}

impl WakeupSource {
    pub(crate) fn flag(self) -> usize {
        match self {
            Self::None => 0,
            Self::WaitList => flags::WAKEUP_BY_WAIT_LIST,
            Self::DeadlineTimer => flags::WAKEUP_BY_DEADLINE_TIMER,
            Self::Bootstrap => flags::WAKEUP_BY_BOOTSTRAP,
            Self::CancelRequest => flags::WAKEUP_BY_CANCEL_REQUEST,
        }
    }
}

/// Resolves the primary wakeup source from a resolved sleep-state snapshot.
///
/// Priority: wait list > deadline timer > bootstrap > cancel request, the
/// latter eligible only outside non-cancellable regions. `None` means no
/// eligible source was found, which is a runtime logic bug diagnosed by the
/// caller.
pub(crate) fn primary_wakeup_source(sleep_state: usize) -> Option<WakeupSource> {
    const ORDERED: [(usize, WakeupSource); 3] = [
        (flags::WAKEUP_BY_WAIT_LIST, WakeupSource::WaitList),
        (flags::WAKEUP_BY_DEADLINE_TIMER, WakeupSource::DeadlineTimer),
        (flags::WAKEUP_BY_BOOTSTRAP, WakeupSource::Bootstrap),
    ];
    for (flag, source) in ORDERED {
        if sleep_state & flag != 0 {
            return Some(source);
        }
    }
    if sleep_state & flags::WAKEUP_BY_CANCEL_REQUEST != 0
        && sleep_state & flags::NON_CANCELLABLE == 0
    {
        return Some(WakeupSource::CancelRequest);
    }
    None
}

/// Decides whether the waker that observed `prev_flags` is the one that
/// reschedules the task.
///
/// All wakers are serialized by the seq_cst `fetch_or`, so exactly one of
/// them sees the state that satisfies this predicate.
pub(crate) fn should_schedule(prev_flags: usize, source: WakeupSource) -> bool {
    if prev_flags & flags::SLEEPING == 0 {
        return false;
    }
    match source {
        // Bootstrap races only with the initial schedule; always ours.
        WakeupSource::Bootstrap => true,
        // Cancel loses to every other source and to non-cancellable parking.
        WakeupSource::CancelRequest => prev_flags == flags::SLEEPING,
        _ => {
            let mut prev = prev_flags;
            if prev & flags::NON_CANCELLABLE != 0 {
                // A suppressed cancel request does not count as a wakeup.
                prev &= !(flags::NON_CANCELLABLE | flags::WAKEUP_BY_CANCEL_REQUEST);
            }
            prev == flags::SLEEPING
        }
    }
}

/// The sleep-state word of one task.
#[derive(Debug)]
pub(crate) struct SleepState {
    inner: AtomicUsize,
}

impl SleepState {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            inner: AtomicUsize::new(initial),
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> usize {
        self.inner.load(order)
    }

    pub(crate) fn store(&self, value: usize, order: Ordering) {
        self.inner.store(value, order);
    }

    /// Serialization point for every wakeup race.
    pub(crate) fn fetch_or(&self, bits: usize) -> usize {
        self.inner.fetch_or(bits, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::flags::*;
    use super::*;

    #[test]
    fn priority_order_is_fixed() {
        let all = WAKEUP_BY_WAIT_LIST
            | WAKEUP_BY_DEADLINE_TIMER
            | WAKEUP_BY_BOOTSTRAP
            | WAKEUP_BY_CANCEL_REQUEST;
        assert_eq!(primary_wakeup_source(all), Some(WakeupSource::WaitList));
        assert_eq!(
            primary_wakeup_source(all & !WAKEUP_BY_WAIT_LIST),
            Some(WakeupSource::DeadlineTimer)
        );
        assert_eq!(
            primary_wakeup_source(WAKEUP_BY_BOOTSTRAP | WAKEUP_BY_CANCEL_REQUEST),
            Some(WakeupSource::Bootstrap)
        );
        assert_eq!(
            primary_wakeup_source(WAKEUP_BY_CANCEL_REQUEST),
            Some(WakeupSource::CancelRequest)
        );
    }

    #[test]
    fn non_cancellable_masks_cancel() {
        assert_eq!(
            primary_wakeup_source(WAKEUP_BY_CANCEL_REQUEST | NON_CANCELLABLE),
            None
        );
        assert_eq!(
            primary_wakeup_source(
                WAKEUP_BY_CANCEL_REQUEST | NON_CANCELLABLE | WAKEUP_BY_WAIT_LIST
            ),
            Some(WakeupSource::WaitList)
        );
    }

    #[test]
    fn only_first_waker_schedules() {
        // First waker sees a bare Sleeping bit.
        assert!(should_schedule(SLEEPING, WakeupSource::WaitList));
        // Second waker sees the first one's bit and backs off.
        assert!(!should_schedule(
            SLEEPING | WAKEUP_BY_DEADLINE_TIMER,
            WakeupSource::WaitList
        ));
    }

    #[test]
    fn waker_without_sleeping_bit_never_schedules() {
        assert!(!should_schedule(0, WakeupSource::WaitList));
        assert!(!should_schedule(WAKEUP_BY_WAIT_LIST, WakeupSource::DeadlineTimer));
        assert!(!should_schedule(0, WakeupSource::Bootstrap));
    }

    #[test]
    fn cancel_schedules_only_when_alone() {
        assert!(should_schedule(SLEEPING, WakeupSource::CancelRequest));
        assert!(!should_schedule(
            SLEEPING | WAKEUP_BY_WAIT_LIST,
            WakeupSource::CancelRequest
        ));
        assert!(!should_schedule(
            SLEEPING | NON_CANCELLABLE,
            WakeupSource::CancelRequest
        ));
    }

    #[test]
    fn suppressed_cancel_does_not_block_real_wakeups() {
        // A cancel bit latched under non-cancellable parking must not stop
        // the first real waker from scheduling.
        assert!(should_schedule(
            SLEEPING | NON_CANCELLABLE | WAKEUP_BY_CANCEL_REQUEST,
            WakeupSource::WaitList
        ));
        assert!(!should_schedule(
            SLEEPING | NON_CANCELLABLE | WAKEUP_BY_WAIT_LIST,
            WakeupSource::DeadlineTimer
        ));
    }

    #[test]
    fn bootstrap_always_schedules_a_sleeper() {
        assert!(should_schedule(
            SLEEPING | WAKEUP_BY_CANCEL_REQUEST,
            WakeupSource::Bootstrap
        ));
    }
}
