//! Error types and error-handling strategy.
//!
//! Errors are explicit and typed. Signals that cross a suspension boundary
//! ([`WaitInterrupted`]) are ordinary `Err` values surfaced to the nearest
//! caller; programmer errors (coroutine-only APIs used outside a coroutine,
//! invalid yields) are diagnosed with a logged backtrace and a panic; queue
//! push/pop failures are plain return values and never panic.

use crate::task::CancelReason;
use thiserror::Error;

/// A suspending call was interrupted because the *waiting* task has been
/// cancel-requested and is cancellable.
///
/// Carries the waiter's cancellation reason. The signal crosses at most one
/// suspension boundary; callers either propagate it with `?` or convert it
/// into their own error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait interrupted: waiting task was cancelled ({0})")]
pub struct WaitInterrupted(pub CancelReason);

/// Spawning a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpawnError {
    /// The coroutine pool hit its configured live-frame limit.
    #[error("coroutine pool exhausted: {live} live coroutines at limit {limit}")]
    PoolExhausted {
        /// Coroutines currently alive.
        live: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Panic payload used to unwind a coroutine stack for deterministic
/// destruction.
///
/// Raised inside a suspended task's `sleep` when the runtime tears the task
/// down; caught only at the coroutine trampoline and converted into a
/// task-cancelled yield. Never observable outside the runtime.
pub(crate) struct CoroUnwind;

/// Diagnoses a coroutine-only API being called with no current task.
#[cold]
pub(crate) fn outside_coroutine_fault(what: &str) -> ! {
    let backtrace = std::backtrace::Backtrace::capture();
    tracing::error!(%backtrace, "{what} called outside a coroutine");
    debug_assert!(false, "{what} called outside a coroutine");
    panic!("{what} called outside a coroutine");
}
