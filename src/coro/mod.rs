//! Stackful coroutine frames and the frame pool.
//!
//! A [`Coroutine`] is a fixed-size stack plus the saved machine contexts of
//! its two sides: the worker that resumes it and the coroutine body itself.
//! The body is one generic trampoline loop that receives a task context per
//! resume, runs the task's payload, and yields back; a frame therefore
//! outlives any single task and is recycled through the [`CoroutinePool`].

mod arch;
pub(crate) mod stack;

use crate::error::SpawnError;
use crate::task::TaskContext;
use arch::{context_switch, entry_arg, MachineContext};
use crossbeam_queue::SegQueue;
use stack::Stack;
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicUsize, Ordering};

/// State shared between a frame's two sides.
///
/// Boxed so the trampoline can hold its address across switches. All access
/// happens on the one OS thread currently running the frame: the worker and
/// the coroutine body alternate on that thread and never run concurrently.
struct FrameShared {
    worker_context: UnsafeCell<MachineContext>,
    coro_context: UnsafeCell<MachineContext>,
    transfer: Cell<*mut TaskContext>,
}

/// A pooled coroutine frame.
pub(crate) struct Coroutine {
    shared: Box<FrameShared>,
    // Owns the stack memory both machine contexts run on.
    stack: Stack,
}

unsafe impl Send for Coroutine {}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("stack_size", &self.stack.size())
            .finish_non_exhaustive()
    }
}

impl Coroutine {
    fn new(stack_size: usize) -> Self {
        let stack = Stack::new(stack_size);
        let shared = Box::new(FrameShared {
            worker_context: UnsafeCell::new(MachineContext::default()),
            coro_context: UnsafeCell::new(MachineContext::default()),
            transfer: Cell::new(std::ptr::null_mut()),
        });
        let shared_ptr = std::ptr::from_ref::<FrameShared>(&shared) as usize as u64;
        let entry = MachineContext::for_entry(stack.top(), trampoline as usize, shared_ptr);
        unsafe { *shared.coro_context.get() = entry };
        Self { shared, stack }
    }

    /// Resumes the frame with `task`; returns when the frame yields.
    ///
    /// Must only be called by the worker thread that owns the current step
    /// of `task`.
    pub(crate) fn resume(&mut self, task: *mut TaskContext) {
        self.shared.transfer.set(task);
        unsafe {
            context_switch(
                self.shared.worker_context.get(),
                self.shared.coro_context.get(),
            );
        }
    }
}

/// The coroutine-side view of a frame, valid for one task run.
pub(crate) struct TaskPipe {
    shared: *const FrameShared,
}

impl TaskPipe {
    /// Transfers control back to the worker that resumed this frame.
    ///
    /// Returns when the frame is next resumed.
    pub(crate) fn yield_to_worker(&self) {
        unsafe {
            context_switch(
                (*self.shared).coro_context.get(),
                (*self.shared).worker_context.get(),
            );
        }
    }
}

/// Body of every coroutine frame.
///
/// Each loop iteration serves one task to its terminal yield. The frame
/// parks at `yield_to_worker` between tasks; a later resume (possibly by a
/// different worker, with a different task) continues the loop.
extern "C" fn trampoline() -> ! {
    // Must run before any call can clobber the callee-saved register.
    let shared = entry_arg() as *const FrameShared;
    let pipe = TaskPipe { shared };
    loop {
        let task = unsafe { (*shared).transfer.get() };
        debug_assert!(!task.is_null());
        TaskContext::coro_func(task, &pipe);
        pipe.yield_to_worker();
    }
}

/// Recycles coroutine frames across tasks.
///
/// Safe to call from any worker thread; acquires are unordered. The live
/// budget bounds the number of frames in existence and is what surfaces
/// pool exhaustion as a recoverable spawn error.
#[derive(Debug)]
pub(crate) struct CoroutinePool {
    cache: SegQueue<Coroutine>,
    stack_size: usize,
    cache_max: usize,
    live: AtomicUsize,
    max_live: usize,
}

impl CoroutinePool {
    pub(crate) fn new(stack_size: usize, cache_max: usize, max_live: usize) -> Self {
        Self {
            cache: SegQueue::new(),
            stack_size,
            cache_max,
            live: AtomicUsize::new(0),
            max_live,
        }
    }

    /// Claims a slot in the live budget for a task about to need a frame.
    pub(crate) fn reserve(&self) -> Result<(), SpawnError> {
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.max_live {
                return Err(SpawnError::PoolExhausted {
                    live,
                    limit: self.max_live,
                });
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => live = current,
            }
        }
    }

    /// Hands out a frame against a previously reserved slot.
    pub(crate) fn acquire(&self) -> Coroutine {
        self.cache
            .pop()
            .unwrap_or_else(|| Coroutine::new(self.stack_size))
    }

    /// Returns a frame and releases its live-budget slot.
    pub(crate) fn release(&self, frame: Coroutine) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        if self.cache.len() < self.cache_max {
            self.cache.push(frame);
        }
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_respects_live_budget() {
        let pool = CoroutinePool::new(16 * 1024, 4, 2);
        assert!(pool.reserve().is_ok());
        assert!(pool.reserve().is_ok());
        let err = pool.reserve().unwrap_err();
        assert_eq!(err, SpawnError::PoolExhausted { live: 2, limit: 2 });
    }

    #[test]
    fn release_frees_budget_and_caches_frames() {
        let pool = CoroutinePool::new(16 * 1024, 4, 1);
        pool.reserve().expect("reserve");
        let frame = pool.acquire();
        assert_eq!(pool.live(), 1);
        assert!(pool.reserve().is_err());
        pool.release(frame);
        assert_eq!(pool.live(), 0);
        assert!(pool.reserve().is_ok());
        // The cached frame is handed back out.
        let _again = pool.acquire();
        assert_eq!(pool.cache.len(), 0);
    }
}
