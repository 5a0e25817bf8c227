//! Task handles.
//!
//! [`TaskHandle`] is the owner-side view of a spawned task: wait for it,
//! cancel it, detach it, or retrieve its result. Dropping an unfinished,
//! undetached handle abandons the task: an `Abandoned` cancellation is
//! requested and ownership moves to the processor, which collects the task
//! once it reaches a terminal state.

use crate::error::WaitInterrupted;
use crate::task::cancel::CancelReason;
use crate::task::context::TaskContext;
use crate::time::Deadline;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// A panic payload carried out of a task.
pub struct PanicPayload(Box<dyn Any + Send + 'static>);

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self(payload)
    }

    /// The raw payload, for downcasting.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        self.0
    }

    fn message(&self) -> &str {
        if let Some(text) = self.0.downcast_ref::<&str>() {
            text
        } else if let Some(text) = self.0.downcast_ref::<String>() {
            text
        } else {
            "opaque panic payload"
        }
    }
}

impl std::fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}

impl std::fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Error returned when retrieving a task's result fails.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The task was torn down before completing its payload.
    #[error("task was cancelled: {0}")]
    Cancelled(CancelReason),
    /// The task's payload panicked.
    #[error("task panicked: {0}")]
    Panicked(PanicPayload),
    /// The *waiting* task was cancelled while waiting for the result.
    #[error(transparent)]
    Interrupted(WaitInterrupted),
}

pub(crate) struct ResultSlot<R> {
    value: Mutex<Option<std::thread::Result<R>>>,
}

impl<R> Default for ResultSlot<R> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

impl<R> ResultSlot<R> {
    pub(crate) fn set(&self, value: std::thread::Result<R>) {
        *self.value.lock() = Some(value);
    }

    fn take(&self) -> Option<std::thread::Result<R>> {
        self.value.lock().take()
    }
}

/// Owner-side view of a spawned task.
pub struct TaskHandle<R> {
    context: Arc<TaskContext>,
    result: Arc<ResultSlot<R>>,
    consumed: bool,
}

impl<R> std::fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.context.task_id())
            .field("finished", &self.context.is_finished())
            .finish_non_exhaustive()
    }
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(context: Arc<TaskContext>, result: Arc<ResultSlot<R>>) -> Self {
        Self {
            context,
            result,
            consumed: false,
        }
    }

    /// Id of the spawned task.
    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.context.task_id()
    }

    /// True once the task reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    /// Waits for the task to finish.
    ///
    /// Must be called from inside a task; fails only when the waiting task
    /// is itself cancelled.
    pub fn wait(&self) -> Result<(), WaitInterrupted> {
        self.context.wait_until(Deadline::unreachable())
    }

    /// Waits for the task to finish, up to `deadline`.
    ///
    /// Returns `Ok` on finish *and* on deadline expiry; check
    /// [`TaskHandle::is_finished`] to tell them apart.
    pub fn wait_until(&self, deadline: Deadline) -> Result<(), WaitInterrupted> {
        self.context.wait_until(deadline)
    }

    /// Requests cooperative cancellation with `reason`.
    ///
    /// The task observes the request at its next suspension point; only the
    /// first reason per task is latched.
    pub fn cancel(&self, reason: CancelReason) {
        self.context.request_cancel(reason);
    }

    /// Releases the task to run unobserved; the processor owns it from here
    /// and collects it once it finishes.
    pub fn detach(mut self) {
        self.consumed = true;
        self.context.detach();
    }

    /// Waits for the task and retrieves the payload's result.
    ///
    /// Must be called from inside a task unless the task already finished.
    /// If the wait is interrupted by the waiter's own cancellation, the
    /// handle is consumed and the task is abandoned, exactly as on drop.
    pub fn get(mut self) -> Result<R, JoinError> {
        while !self.context.is_finished() {
            // On interruption `self` drops and the abandon path runs.
            self.context
                .wait_until(Deadline::unreachable())
                .map_err(JoinError::Interrupted)?;
        }
        self.consumed = true;
        match self.result.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => Err(JoinError::Panicked(PanicPayload::new(panic))),
            None => Err(JoinError::Cancelled(
                self.context
                    .cancellation_reason()
                    .unwrap_or(CancelReason::UserRequest),
            )),
        }
    }

    /// Retrieves the result without waiting; `None` while the task runs.
    pub fn try_get(&mut self) -> Option<Result<R, JoinError>> {
        if !self.context.is_finished() {
            return None;
        }
        Some(match self.result.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => Err(JoinError::Panicked(PanicPayload::new(panic))),
            None => Err(JoinError::Cancelled(
                self.context
                    .cancellation_reason()
                    .unwrap_or(CancelReason::UserRequest),
            )),
        })
    }
}

impl<R> Drop for TaskHandle<R> {
    fn drop(&mut self) {
        if self.consumed || self.context.is_finished() {
            return;
        }
        self.context.request_cancel(CancelReason::Abandoned);
        self.context.detach();
    }
}
