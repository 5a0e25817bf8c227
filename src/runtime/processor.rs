//! The task processor: a ready queue plus a fixed set of worker threads.
//!
//! Workers loop dequeue → step; the ready queue is a lock-free FIFO with
//! condvar parking for idle workers. Detached tasks are owned by the
//! processor and collected at their terminal transition; shutdown cancels
//! and unwinds whatever is still alive so coroutine stacks are destroyed
//! deterministically.

use crate::coro::CoroutinePool;
use crate::ev::EventThreadPool;
use crate::runtime::config::TaskProcessorConfig;
use crate::runtime::counters::TaskCounter;
use crate::task::cancel::CancelReason;
use crate::task::context::TaskContext;
use crate::task::{self, Importance};
use crossbeam_queue::SegQueue;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace};

/// How long an idle worker parks before re-checking the queue; a backstop
/// against a notify racing the park.
const WORKER_PARK_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) struct ProcessorInner {
    config: TaskProcessorConfig,
    ready: SegQueue<Arc<TaskContext>>,
    park_mutex: Mutex<()>,
    park_condvar: Condvar,
    shutdown: AtomicBool,
    coroutine_pool: CoroutinePool,
    event_pool: EventThreadPool,
    // Shared so counter tokens can outlive the processor.
    counters: Arc<TaskCounter>,
    detached: parking_lot::Mutex<HashMap<u64, Arc<TaskContext>>>,
}

impl ProcessorInner {
    pub(crate) fn config(&self) -> &TaskProcessorConfig {
        &self.config
    }

    pub(crate) fn counters(&self) -> &TaskCounter {
        &self.counters
    }

    pub(crate) fn counters_shared(&self) -> &Arc<TaskCounter> {
        &self.counters
    }

    pub(crate) fn coroutine_pool(&self) -> &CoroutinePool {
        &self.coroutine_pool
    }

    pub(crate) fn event_pool(&self) -> &EventThreadPool {
        &self.event_pool
    }

    /// Appends a queued task to the ready FIFO and unparks a worker.
    pub(crate) fn schedule(&self, task: Arc<TaskContext>) {
        if self.shutdown.load(Ordering::Acquire) {
            // Workers are gone; the shutdown path steps leftovers itself.
            return;
        }
        self.ready.push(task);
        // Notify under the park lock so a worker between its queue re-check
        // and its wait cannot miss the wakeup.
        let _guard = self.park_mutex.lock().expect("worker park lock poisoned");
        self.park_condvar.notify_one();
    }

    /// Takes ownership of a detached task until it finishes.
    pub(crate) fn register_detached(&self, task: Arc<TaskContext>) {
        // Nothing drains the registry after shutdown; a task detached past
        // that point is simply dropped with its last handle.
        if task.is_finished() || self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let task_id = task.task_id();
        self.detached.lock().insert(task_id, task);
        // The task may have finished between the check and the insert; the
        // collecting worker has already run by then, so sweep here.
        let finished = self
            .detached
            .lock()
            .get(&task_id)
            .is_some_and(|task| task.is_finished());
        if finished {
            self.detached.lock().remove(&task_id);
        }
    }

    pub(crate) fn collect_detached(&self, task: &TaskContext) {
        self.detached.lock().remove(&task.task_id());
    }

    fn next_ready_task(&self) -> Option<Arc<TaskContext>> {
        loop {
            if let Some(task) = self.ready.pop() {
                return Some(task);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let guard = self.park_mutex.lock().expect("worker park lock poisoned");
            if let Some(task) = self.ready.pop() {
                return Some(task);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let _ = self
                .park_condvar
                .wait_timeout(guard, WORKER_PARK_TIMEOUT)
                .expect("worker park lock poisoned");
        }
    }

    fn worker_loop(&self) {
        while let Some(task) = self.next_ready_task() {
            task.step();
            if task.is_finished() && task.is_detached() {
                self.collect_detached(&task);
            }
        }
        trace!("worker shutting down");
    }
}

impl std::fmt::Debug for ProcessorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorInner")
            .field("ready", &self.ready.len())
            .field("detached", &self.detached.lock().len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A cloneable, sharable reference to a processor.
///
/// This is what tasks use to spawn further tasks: the owning
/// [`TaskProcessor`] itself stays on the thread that created it.
#[derive(Clone, Debug)]
pub struct ProcessorHandle {
    inner: Arc<ProcessorInner>,
}

impl ProcessorHandle {
    pub(crate) fn from_inner(inner: Arc<ProcessorInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ProcessorInner> {
        &self.inner
    }

    /// Task accounting for this processor.
    #[must_use]
    pub fn counters(&self) -> &TaskCounter {
        self.inner.counters()
    }

    /// Picks an event thread round-robin, e.g. to arm a
    /// [`Timer`](crate::ev::Timer) on it.
    #[must_use]
    pub fn next_event_thread(&self) -> Arc<crate::ev::EventThread> {
        self.inner.event_pool().next_thread()
    }

    /// Runs `f` as a root task and blocks the calling OS thread until it
    /// completes. Panics from `f` are resumed on the caller.
    ///
    /// This is the bridge for threads outside the runtime; it must not be
    /// called from inside a task.
    pub fn run_blocking<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        debug_assert!(
            crate::task::current::context_unchecked().is_none(),
            "run_blocking called from inside a task"
        );
        let done = Arc::new((Mutex::new(None::<std::thread::Result<R>>), Condvar::new()));
        let signal = Arc::clone(&done);
        let handle = task::spawn(self, Importance::Normal, move || {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(f)) {
                Err(panic) if panic.is::<crate::error::CoroUnwind>() => {
                    std::panic::resume_unwind(panic)
                }
                outcome => outcome,
            };
            let (lock, condvar) = &*signal;
            *lock.lock().expect("run_blocking lock poisoned") = Some(outcome);
            condvar.notify_one();
        })
        .expect("coroutine pool exhausted while spawning a root task");
        handle.detach();

        let (lock, condvar) = &*done;
        let mut outcome = lock.lock().expect("run_blocking lock poisoned");
        while outcome.is_none() {
            outcome = condvar
                .wait(outcome)
                .expect("run_blocking lock poisoned");
        }
        match outcome.take().expect("outcome checked above") {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// A scheduler with its own ready queue and worker threads.
///
/// Dropping the processor shuts it down: workers are joined, remaining tasks
/// are cancelled with [`CancelReason::Shutdown`] and their coroutine stacks
/// unwound.
#[derive(Debug)]
pub struct TaskProcessor {
    inner: Arc<ProcessorInner>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskProcessor {
    /// Starts a processor with the given configuration.
    #[must_use]
    pub fn new(mut config: TaskProcessorConfig) -> Self {
        config.normalize();
        let event_pool = EventThreadPool::new(config.event_threads, &config.thread_name_prefix);
        let coroutine_pool = CoroutinePool::new(
            config.coro_stack_size,
            config.coro_cache_max,
            config.max_live_coroutines,
        );
        let inner = Arc::new(ProcessorInner {
            ready: SegQueue::new(),
            park_mutex: Mutex::new(()),
            park_condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            coroutine_pool,
            event_pool,
            counters: Arc::new(TaskCounter::new()),
            detached: parking_lot::Mutex::new(HashMap::new()),
            config,
        });
        let mut workers = Vec::with_capacity(inner.config.worker_threads);
        for index in 0..inner.config.worker_threads {
            let worker = Arc::clone(&inner);
            let join = std::thread::Builder::new()
                .name(format!("{}-{index}", inner.config.thread_name_prefix))
                .spawn(move || worker.worker_loop())
                .expect("failed to spawn worker thread");
            workers.push(join);
        }
        Self { inner, workers }
    }

    /// A cloneable handle for spawning onto this processor.
    #[must_use]
    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle::from_inner(Arc::clone(&self.inner))
    }

    /// Task accounting for this processor.
    #[must_use]
    pub fn counters(&self) -> &TaskCounter {
        self.inner.counters()
    }

    /// Picks an event thread round-robin.
    #[must_use]
    pub fn next_event_thread(&self) -> Arc<crate::ev::EventThread> {
        self.inner.event_pool().next_thread()
    }

    /// See [`ProcessorHandle::run_blocking`].
    pub fn run_blocking<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle().run_blocking(f)
    }

    /// Stops the processor: joins workers, then cancels and unwinds every
    /// task it still owns. Idempotent.
    pub fn stop(&mut self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.park_condvar.notify_all();
        for join in self.workers.drain(..) {
            let _ = join.join();
        }

        // Workers are gone; nothing else can be stepping these tasks.
        let mut leftovers: HashMap<u64, Arc<TaskContext>> =
            self.inner.detached.lock().drain().collect();
        while let Some(task) = self.inner.ready.pop() {
            leftovers.entry(task.task_id()).or_insert(task);
        }
        if !leftovers.is_empty() {
            debug!(count = leftovers.len(), "unwinding leftover tasks at shutdown");
        }
        for task in leftovers.into_values() {
            if task.is_finished() {
                continue;
            }
            task.request_cancel(CancelReason::Shutdown);
            task.request_unwind();
            while !task.is_finished() {
                // Normalize Suspended tasks whose cancel wakeup was lost or
                // suppressed; post-shutdown schedule() does not enqueue.
                task.schedule();
                task.step();
            }
        }
        while self.inner.ready.pop().is_some() {}
        self.inner.event_pool.shutdown();
    }
}

impl Default for TaskProcessor {
    fn default() -> Self {
        Self::new(TaskProcessorConfig::default())
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
