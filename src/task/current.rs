//! The current-task API.
//!
//! These functions act on the task currently executing on this thread.
//! Calling them with no current task is a logic fault: it is diagnosed with
//! a logged backtrace and a panic.

use crate::error::outside_coroutine_fault;
use crate::sync::WaitStrategy;
use crate::task::cancel::CancelReason;
use crate::task::context::TaskContext;
use crate::task::sleep::WakeupSource;
use crate::time::Deadline;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    static CURRENT_TASK: Cell<*const TaskContext> = const { Cell::new(std::ptr::null()) };
}

/// Publishes `context` as this thread's current task. Internal to the step
/// scope; a non-null value may only replace null and vice versa.
pub(crate) fn set_current(context: *const TaskContext) {
    CURRENT_TASK.with(|current| {
        debug_assert!(
            current.get().is_null() || context.is_null(),
            "nested current-task scopes"
        );
        current.set(context);
    });
}

pub(crate) fn is_current(context: &TaskContext) -> bool {
    CURRENT_TASK.with(|current| std::ptr::eq(current.get(), context))
}

/// The current task, if any.
///
/// The returned `Arc` is cloned out of the live task; the raw slot stays
/// valid for the duration of the step that published it.
pub(crate) fn context_unchecked() -> Option<Arc<TaskContext>> {
    let ptr = CURRENT_TASK.with(Cell::get);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr }.shared())
    }
}

/// The current task; faults when called outside a coroutine.
pub(crate) fn context() -> Arc<TaskContext> {
    context_unchecked().unwrap_or_else(|| outside_coroutine_fault("current-task API"))
}

/// True when there is a current task and it should observe cancellation.
/// Unlike the public API this is callable anywhere; outside a coroutine it
/// is simply false.
pub(crate) fn should_cancel_unchecked() -> bool {
    context_unchecked().is_some_and(|context| context.should_cancel())
}

/// Id of the current task.
#[must_use]
pub fn task_id() -> u64 {
    context().task_id()
}

/// Handle to the processor the current task runs on, e.g. for spawning
/// child tasks.
#[must_use]
pub fn processor() -> crate::runtime::ProcessorHandle {
    crate::runtime::ProcessorHandle::from_inner(
        context()
            .processor()
            .expect("running task has no live processor"),
    )
}

/// Yields the current task back to the ready queue, letting other tasks run.
pub fn yield_now() {
    sleep_until(Deadline::passed());
}

/// Suspends the current task until `deadline`.
///
/// A cancellation request also wakes the task; inspect
/// [`should_cancel`] or [`wakeup_source`] afterwards.
pub fn sleep_until(deadline: Deadline) {
    let current = context();
    let strategy = DeadlineWaitStrategy { deadline };
    current.sleep(&strategy);
}

/// Suspends the current task for `duration`.
pub fn sleep_for(duration: Duration) {
    sleep_until(Deadline::from_duration(duration));
}

/// True when the current task has a latched cancellation request, whether or
/// not it is willing to observe it yet.
#[must_use]
pub fn cancellation_requested() -> bool {
    context().is_cancel_requested()
}

/// True when the current task has been cancel-requested and is cancellable.
#[must_use]
pub fn should_cancel() -> bool {
    context().should_cancel()
}

/// The latched cancellation reason of the current task, if any.
#[must_use]
pub fn cancellation_reason() -> Option<CancelReason> {
    context().cancellation_reason()
}

/// Toggles the current task's cancellability; returns the previous value.
#[must_use]
pub fn set_cancellable(value: bool) -> bool {
    context().set_cancellable(value)
}

/// The resolved cause of the current task's last awakening.
#[must_use]
pub fn wakeup_source() -> WakeupSource {
    context().wakeup_source()
}

/// Scoped non-cancellable region.
///
/// While the blocker is alive, cancel wakeups are suppressed for the current
/// task; the cancellation reason is still latched and observed once the
/// blocker is dropped.
#[derive(Debug)]
pub struct CancellationBlocker {
    previous: bool,
    // Must be dropped on the task that created it.
    _not_send: PhantomData<*const ()>,
}

impl CancellationBlocker {
    /// Enters a non-cancellable region on the current task.
    #[must_use]
    pub fn new() -> Self {
        Self {
            previous: set_cancellable(false),
            _not_send: PhantomData,
        }
    }
}

impl Default for CancellationBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        let _ = set_cancellable(self.previous);
    }
}

struct DeadlineWaitStrategy {
    deadline: Deadline,
}

impl WaitStrategy for DeadlineWaitStrategy {
    fn deadline(&self) -> Deadline {
        self.deadline
    }

    fn after_asleep(&self) {}

    fn before_awake(&self) {}
}
