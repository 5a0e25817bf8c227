//! Weft: a cooperative stackful task runtime with bounded concurrent queues.
//!
//! # Overview
//!
//! Weft multiplexes many lightweight tasks onto a small pool of OS worker
//! threads. Tasks are stackful coroutines: they suspend voluntarily at
//! blocking calls and resume where they left off, with no preemption. The
//! companion primitive is a bounded producer/consumer queue whose blocking
//! paths suspend through the same scheduler.
//!
//! # Core guarantees
//!
//! - **Exactly-one wakeup**: of all wakers racing to resume a suspended
//!   task (wait list, deadline timer, cancellation), exactly one schedules
//!   it.
//! - **Cooperative cancellation**: a cancellation reason is latched once
//!   per task and observed at the next suspension point; tasks can enter
//!   non-cancellable regions; critical tasks always run their payload at
//!   least once.
//! - **End-of-stream queues**: dropping the last handle on one queue side
//!   permanently unblocks the other, so peers observe shutdown instead of
//!   hanging.
//!
//! # Module structure
//!
//! - [`runtime`]: the task processor (ready queue + worker threads)
//! - [`task`]: spawn, handles, lifecycle, the current-task API
//! - [`queue`]: bounded MP/SP × MC/SC queues
//! - [`sync`]: wake events and semaphores built on the task sleep path
//! - [`ev`]: event threads and one-shot timers
//! - [`time`]: wait deadlines
//! - [`error`]: the typed error surface
//!
//! # Example
//!
//! ```no_run
//! use weft::{Importance, TaskProcessor, TaskProcessorConfig};
//!
//! let processor = TaskProcessor::new(TaskProcessorConfig::default());
//! let total = processor.run_blocking(|| {
//!     let processor = weft::current_task::processor();
//!     let handle = weft::spawn(&processor, Importance::Normal, || 2 + 2)
//!         .expect("spawn failed");
//!     handle.get().expect("task failed")
//! });
//! assert_eq!(total, 4);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod coro;
pub mod error;
pub mod ev;
pub mod queue;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use error::{SpawnError, WaitInterrupted};
pub use queue::{Consumer, GenericQueue, MpmcQueue, MpscQueue, Producer, SpmcQueue, SpscQueue};
pub use runtime::{ProcessorHandle, TaskCounter, TaskProcessor, TaskProcessorConfig};
pub use task::current as current_task;
pub use task::{
    spawn, CancelReason, Importance, JoinError, PanicPayload, TaskHandle, TaskState, WakeupSource,
};
pub use time::Deadline;
