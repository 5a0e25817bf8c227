//! The wait-strategy interface between primitives and the task sleep path.
//!
//! A synchronisation primitive that needs to park the current task hands a
//! strategy to `TaskContext::sleep`. The hook order closes the lost-wakeup
//! race: the task yields first, then `after_asleep` registers it on the
//! primitive's wait list under the list lock and re-checks readiness,
//! self-waking if the world changed in the interval. `before_awake` runs in
//! the coroutine right before `sleep` returns and must cancel any racy
//! wakers; it may itself suspend (the strategy pointer is saved and restored
//! as a stack discipline).

use crate::sync::WaitList;
use crate::time::Deadline;

pub(crate) trait WaitStrategy {
    /// Deadline for this wait; the sleep path arms a one-shot timer for it.
    fn deadline(&self) -> Deadline;

    /// Runs on the worker thread once the task has yielded; registers the
    /// parked task on the primitive's wait list and self-wakes it if
    /// readiness already changed.
    fn after_asleep(&self);

    /// Runs inside the coroutine before `sleep` returns.
    fn before_awake(&self);

    /// The wait list the task was registered on, if any. The sleep path
    /// removes the task from it when the wakeup came from another source.
    fn wait_list(&self) -> Option<&WaitList> {
        None
    }
}
