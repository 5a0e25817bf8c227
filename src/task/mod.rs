//! Tasks: spawn, handles, lifecycle, cancellation, the current-task API.

pub(crate) mod cancel;
pub(crate) mod context;
pub mod current;
pub(crate) mod handle;
pub(crate) mod sleep;
pub(crate) mod state;

pub use cancel::CancelReason;
pub use context::Importance;
pub use handle::{JoinError, PanicPayload, TaskHandle};
pub use sleep::WakeupSource;
pub use state::TaskState;

pub(crate) use context::{Payload, TaskContext};

use crate::error::SpawnError;
use crate::runtime::ProcessorHandle;
use handle::ResultSlot;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Spawns a task on `processor` and schedules it immediately.
///
/// The payload runs exactly once inside a coroutine frame; its return value
/// (or panic) is retrieved through the handle. Fails only when the
/// coroutine pool's live budget is exhausted.
pub fn spawn<F, R>(
    processor: &ProcessorHandle,
    importance: Importance,
    payload: F,
) -> Result<TaskHandle<R>, SpawnError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let inner = processor.inner();
    inner.coroutine_pool().reserve()?;

    let result = Arc::new(ResultSlot::default());
    let slot = Arc::clone(&result);
    let wrapped: Payload = Box::new(move || {
        match std::panic::catch_unwind(AssertUnwindSafe(payload)) {
            Ok(value) => slot.set(Ok(value)),
            // The coroutine-unwind sentinel must keep unwinding to the
            // trampoline; it is not a payload failure.
            Err(panic) if panic.is::<crate::error::CoroUnwind>() => {
                std::panic::resume_unwind(panic)
            }
            Err(panic) => slot.set(Err(panic)),
        }
    });

    let context = TaskContext::new(inner, importance, wrapped);
    context.schedule();
    Ok(TaskHandle::new(context, result))
}
