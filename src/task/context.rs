//! The task context state machine.
//!
//! A [`TaskContext`] is one cooperative task: its lifecycle state, its
//! cancellation latch, the sleep-state word that arbitrates concurrent
//! wakers, and (while it has one) the coroutine frame its payload runs on.
//!
//! Ownership discipline: the fields behind `inner` are only ever touched by
//! the worker thread currently stepping the task — the coroutine body runs
//! on that same OS thread — or by the shutdown path after all workers have
//! been joined. Everything shared across threads is atomic or behind the
//! wait-list lock.

use crate::coro::{Coroutine, TaskPipe};
use crate::error::{CoroUnwind, WaitInterrupted};
use crate::runtime::counters::CounterToken;
use crate::runtime::ProcessorInner;
use crate::sync::{WaitList, WaitStrategy};
use crate::task::cancel::{AtomicCancelReason, CancelReason};
use crate::task::current;
use crate::task::sleep::{
    flags, primary_wakeup_source, should_schedule, SleepState, WakeupSource,
};
use crate::task::state::{AtomicTaskState, TaskState};
use crate::time::Deadline;
use std::cell::UnsafeCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, trace, warn};

/// Importance of a task, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Importance {
    /// May be shed under overload before its payload ever runs.
    Normal,
    /// Immune to cancel-on-spawn: the payload runs at least once, up to its
    /// first voluntary yield.
    Critical,
}

/// The one-shot callable a task runs.
pub(crate) type Payload = Box<dyn FnOnce() + Send + 'static>;

/// Why the coroutine yielded back to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YieldReason {
    None,
    TaskWaiting,
    TaskComplete,
    TaskCancelled,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Worker-owned mutable state; see the module docs for the discipline.
struct TaskInner {
    payload: Option<Payload>,
    coroutine: Option<Coroutine>,
    task_pipe: Option<*const TaskPipe>,
    wait_strategy: Option<StrategyPtr>,
    yield_reason: YieldReason,
    wakeup_source: WakeupSource,
    unwind_requested: bool,
    execute_started: Option<Instant>,
}

/// Borrow-erased wait-strategy pointer, valid across one suspension.
#[derive(Clone, Copy)]
struct StrategyPtr(*const (dyn WaitStrategy + 'static));

impl StrategyPtr {
    /// Caller guarantees the strategy outlives the suspension it is
    /// registered for.
    unsafe fn new(strategy: &dyn WaitStrategy) -> Self {
        let ptr = std::ptr::from_ref(strategy);
        Self(unsafe {
            std::mem::transmute::<*const (dyn WaitStrategy + '_), *const (dyn WaitStrategy + 'static)>(
                ptr,
            )
        })
    }

    unsafe fn get<'a>(self) -> &'a dyn WaitStrategy {
        unsafe { &*self.0 }
    }
}

/// One cooperative task.
pub struct TaskContext {
    task_id: u64,
    // Every context lives in an Arc; wakers and timers clone out of this.
    self_ref: std::sync::Weak<TaskContext>,
    // Weak: the processor owns detached tasks through its registry, so this
    // back-edge must not keep the runtime alive.
    processor: std::sync::Weak<ProcessorInner>,
    counter_token: CounterToken,
    is_critical: bool,
    state: AtomicTaskState,
    is_detached: AtomicBool,
    is_cancellable: AtomicBool,
    cancellation_reason: AtomicCancelReason,
    finish_waiters: WaitList,
    sleep_state: SleepState,
    trace_csw_left: AtomicU32,
    last_state_change: parking_lot::Mutex<Option<Instant>>,
    inner: UnsafeCell<TaskInner>,
}

unsafe impl Send for TaskContext {}
unsafe impl Sync for TaskContext {}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("is_critical", &self.is_critical)
            .field("cancellation_reason", &self.cancellation_reason.get())
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub(crate) fn new(
        processor: &Arc<ProcessorInner>,
        importance: Importance,
        payload: Payload,
    ) -> Arc<Self> {
        let task_id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let counter_token = CounterToken::new(Arc::clone(processor.counters_shared()));
        let trace_csw_left = processor.config().task_trace_max_csw;
        let context = Arc::new_cyclic(|self_ref| Self {
            task_id,
            self_ref: self_ref.clone(),
            processor: Arc::downgrade(processor),
            counter_token,
            is_critical: importance == Importance::Critical,
            state: AtomicTaskState::new(TaskState::New),
            is_detached: AtomicBool::new(false),
            is_cancellable: AtomicBool::new(true),
            cancellation_reason: AtomicCancelReason::new(),
            finish_waiters: WaitList::new(),
            sleep_state: SleepState::new(flags::SLEEPING),
            trace_csw_left: AtomicU32::new(trace_csw_left),
            last_state_change: parking_lot::Mutex::new(None),
            inner: UnsafeCell::new(TaskInner {
                payload: Some(payload),
                coroutine: None,
                task_pipe: None,
                wait_strategy: None,
                yield_reason: YieldReason::None,
                wakeup_source: WakeupSource::None,
                unwind_requested: false,
                execute_started: None,
            }),
        });
        debug_assert!(context.self_ref.upgrade().is_some());
        trace!(
            task_id,
            parent_task_id = current::context_unchecked().map_or(0, |parent| parent.task_id),
            "task created"
        );
        context
    }

    fn inner(&self) -> *mut TaskInner {
        self.inner.get()
    }

    /// A fresh strong reference to this context.
    pub(crate) fn shared(&self) -> Arc<TaskContext> {
        self.self_ref
            .upgrade()
            .expect("task context used after its Arc was gone")
    }

    /// Process-wide monotone task id.
    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load(Ordering::SeqCst)
    }

    /// Returns true once the task reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub(crate) fn started_as_critical(&self) -> bool {
        self.is_critical
    }

    /// The owning processor, unless the runtime is already gone.
    pub(crate) fn processor(&self) -> Option<Arc<ProcessorInner>> {
        self.processor.upgrade()
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.is_detached.load(Ordering::Relaxed)
    }

    /// Releases the task to the processor: it is collected at its terminal
    /// transition, or dropped with its last reference if the runtime is
    /// already shut down.
    pub(crate) fn detach(&self) {
        let was_detached = self.is_detached.swap(true, Ordering::Relaxed);
        debug_assert!(!was_detached, "task detached twice");
        if let Some(processor) = self.processor.upgrade() {
            processor.register_detached(self.shared());
        }
    }

    pub(crate) fn is_cancellable(&self) -> bool {
        self.is_cancellable.load(Ordering::Relaxed)
    }

    /// Toggles cancellability; only the task itself may call this while
    /// running. Returns the previous value.
    pub(crate) fn set_cancellable(&self, value: bool) -> bool {
        debug_assert!(
            current::is_current(self),
            "set_cancellable called from outside the task"
        );
        self.is_cancellable.swap(value, Ordering::Relaxed)
    }

    fn set_cancellable_raw(&self, value: bool) -> bool {
        self.is_cancellable.swap(value, Ordering::Relaxed)
    }

    pub(crate) fn cancellation_reason(&self) -> Option<CancelReason> {
        self.cancellation_reason.get()
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason.get().is_some()
    }

    /// True when the task has a latched cancellation it is willing to
    /// observe.
    pub(crate) fn should_cancel(&self) -> bool {
        self.is_cancel_requested() && self.is_cancellable()
    }

    fn wait_interrupted(&self) -> WaitInterrupted {
        WaitInterrupted(
            self.cancellation_reason()
                .unwrap_or(CancelReason::UserRequest),
        )
    }

    /// The resolved cause of the last awakening; meaningful only to the task
    /// itself, after a sleep.
    pub(crate) fn wakeup_source(&self) -> WakeupSource {
        debug_assert!(current::is_current(self));
        unsafe { (*self.inner()).wakeup_source }
    }

    /// Latches a cancellation reason; the first caller wins and wakes the
    /// task. Returns true for the winning call.
    pub(crate) fn request_cancel(&self, reason: CancelReason) -> bool {
        if self.cancellation_reason.try_set(reason) {
            trace!(
                task_id = self.task_id,
                %reason,
                requested_by = current::context_unchecked().map_or(0, |c| c.task_id),
                "task cancellation requested"
            );
            self.counter_token.counter().account_cancel();
            self.wakeup(WakeupSource::CancelRequest);
            true
        } else {
            false
        }
    }

    /// Flags `unwind` for the next resumption so the coroutine stack is torn
    /// down deterministically.
    ///
    /// Only the shutdown path may call this, after every worker has been
    /// joined: nothing else may be stepping the task.
    pub(crate) fn request_unwind(&self) {
        unsafe { (*self.inner()).unwind_requested = true };
    }

    /// Moves the task into the ready queue.
    ///
    /// The CAS over the lifecycle state makes this idempotent: of all racing
    /// callers (the spawning owner, concurrent wakers), exactly one enqueues
    /// the context.
    pub(crate) fn schedule(&self) {
        let Some(processor) = self.processor.upgrade() else {
            // No runtime left to run the task.
            return;
        };
        let mut observed = self.state.load(Ordering::SeqCst);
        loop {
            match observed {
                TaskState::New | TaskState::Suspended => {
                    match self.state.compare_exchange(observed, TaskState::Queued) {
                        Ok(_) => break,
                        Err(now) => observed = now,
                    }
                }
                // Already owned by the ready queue or a worker; latched
                // wakeup bits will be observed at the next suspension.
                TaskState::Queued | TaskState::Running => return,
                TaskState::Completed | TaskState::Cancelled | TaskState::Invalid => return,
            }
        }
        self.trace_state_transition(TaskState::Queued);
        processor.schedule(self.shared());
    }

    /// Wakes the task for `source`.
    ///
    /// Sets the source bit unconditionally: a missing `Sleeping` bit means
    /// the task is between yielding and parking, or already awake with its
    /// `before_awake` not finished; either way the bit is latched and
    /// absorbed later. Exactly one of the racing wakers passes the
    /// should-schedule predicate.
    pub(crate) fn wakeup(&self, source: WakeupSource) {
        if self.is_finished() {
            return;
        }
        if source == WakeupSource::CancelRequest
            && self.sleep_state.load(Ordering::SeqCst) & flags::NON_CANCELLABLE != 0
        {
            return;
        }
        let prev = self.sleep_state.fetch_or(source.flag());
        if should_schedule(prev, source) {
            self.schedule();
        }
    }

    /// Runs one cooperative slice of the task on the calling worker thread.
    pub(crate) fn step(&self) {
        if self.is_finished() {
            return;
        }
        let Some(processor) = self.processor.upgrade() else {
            return;
        };
        let inner = self.inner();

        let mut clear_flags = flags::SLEEPING;
        let mut coroutine = match unsafe { (*inner).coroutine.take() } {
            Some(frame) => frame,
            None => {
                clear_flags |= flags::WAKEUP_BY_BOOTSTRAP;
                processor.coroutine_pool().acquire()
            }
        };
        // Non-atomic clear: losing a spurious wakeup bit here is harmless,
        // the task is about to run anyway.
        let sleep_state = self.sleep_state.load(Ordering::Relaxed);
        self.sleep_state
            .store(sleep_state & !clear_flags, Ordering::Relaxed);

        {
            let _scope = CurrentTaskScope::new(self);
            self.set_state(TaskState::Running);
            coroutine.resume(std::ptr::from_ref(self).cast_mut());
            if let Some(strategy) = unsafe { (*inner).wait_strategy } {
                unsafe { strategy.get().after_asleep() };
            }
        }

        match unsafe { (*inner).yield_reason } {
            reason @ (YieldReason::TaskComplete | YieldReason::TaskCancelled) => {
                // The frame goes back to the pool before waiters are woken.
                processor.coroutine_pool().release(coroutine);
                let new_state = if reason == YieldReason::TaskComplete {
                    TaskState::Completed
                } else {
                    TaskState::Cancelled
                };
                self.set_state(new_state);
                self.trace_state_transition(new_state);
            }
            YieldReason::TaskWaiting => {
                self.set_state(TaskState::Suspended);
                unsafe { (*inner).coroutine = Some(coroutine) };
                let mut new_flags = flags::SLEEPING;
                if !self.is_cancellable() {
                    new_flags |= flags::NON_CANCELLABLE;
                }
                // Synchronization point for the relaxed state store and the
                // coroutine hand-back above.
                let mut prev = self.sleep_state.fetch_or(new_flags);
                debug_assert!(prev & flags::SLEEPING == 0);
                if new_flags & flags::NON_CANCELLABLE != 0 {
                    prev &= !(flags::WAKEUP_BY_CANCEL_REQUEST | flags::NON_CANCELLABLE);
                }
                if prev != 0 {
                    // Awakened while parking; we are the scheduler.
                    self.schedule();
                }
            }
            YieldReason::None => {
                error!(task_id = self.task_id, "task yielded with no reason");
                debug_assert!(false, "invalid yield reason");
                panic!("invalid yield reason");
            }
        }
    }

    /// Suspends the current task under `strategy`. Runs inside the
    /// coroutine; returns when the task is next stepped.
    pub(crate) fn sleep(&self, strategy: &dyn WaitStrategy) {
        debug_assert!(current::is_current(self), "sleep on a foreign task");
        debug_assert_eq!(self.state.load(Ordering::Relaxed), TaskState::Running);
        let inner = self.inner();

        // A strategy's before_awake may sleep again (a condition variable
        // re-acquiring its mutex); keep the outer pointer on this stack.
        let outer_strategy = unsafe {
            std::mem::replace(
                &mut (*inner).wait_strategy,
                Some(StrategyPtr::new(strategy)),
            )
        };

        let mut deadline_timer = None;
        let deadline = strategy.deadline();
        if deadline.is_reachable() {
            match deadline.time_left_nonzero() {
                Some(time_left) => {
                    let processor = self
                        .processor
                        .upgrade()
                        .expect("sleeping task outlived its processor");
                    let context = self.shared();
                    deadline_timer = Some(crate::ev::Timer::new(
                        processor.event_pool().next_thread(),
                        move || context.wakeup(WakeupSource::DeadlineTimer),
                        time_left,
                    ));
                }
                None => self.wakeup(WakeupSource::DeadlineTimer),
            }
        }

        unsafe { (*inner).yield_reason = YieldReason::TaskWaiting };
        self.trace_state_transition(TaskState::Suspended);
        self.profiler_stop_execution();
        let pipe = unsafe { (*inner).task_pipe.expect("sleep outside a task step") };
        unsafe { (*pipe).yield_to_worker() };
        self.profiler_start_execution();
        self.trace_state_transition(TaskState::Running);
        debug_assert_eq!(self.state.load(Ordering::Relaxed), TaskState::Running);

        if let Some(timer) = deadline_timer.take() {
            timer.stop();
        }

        if self.sleep_state.load(Ordering::Acquire) & flags::WAKEUP_BY_WAIT_LIST == 0 {
            if let Some(wait_list) = strategy.wait_list() {
                wait_list.remove(self);
            }
        }

        if unsafe { (*inner).unwind_requested } {
            self.sleep_state.store(0, Ordering::Relaxed);
            std::panic::panic_any(CoroUnwind);
        }

        // Resolve the wakeup source, then clear the word: before_awake may
        // itself sleep and needs a clean slate.
        let old_sleep_state = self.sleep_state.load(Ordering::Acquire);
        self.sleep_state.store(0, Ordering::Relaxed);
        unsafe {
            (*inner).wakeup_source = match primary_wakeup_source(old_sleep_state) {
                Some(source) => source,
                None => {
                    let backtrace = std::backtrace::Backtrace::capture();
                    error!(
                        task_id = self.task_id,
                        sleep_state = old_sleep_state,
                        %backtrace,
                        "no valid wakeup source"
                    );
                    debug_assert!(false, "no valid wakeup source");
                    panic!("no valid wakeup source (sleep_state = {old_sleep_state:#x})");
                }
            };
        }

        strategy.before_awake();
        unsafe { (*inner).wait_strategy = outer_strategy };

        // Absorb wakers racing with before_awake; any such waker was
        // cancelled there and its late bit must not leak into the next
        // suspension.
        self.sleep_state.store(0, Ordering::Relaxed);
    }

    /// Waits for this task to finish, up to `deadline`.
    ///
    /// Returns `Ok` both on finish and on deadline expiry (callers check
    /// [`TaskContext::is_finished`]); fails only when the *waiting* task has
    /// been cancelled.
    pub(crate) fn wait_until(&self, deadline: Deadline) -> Result<(), WaitInterrupted> {
        // Avoid the context switch when possible.
        if self.is_finished() {
            return Ok(());
        }
        let current = current::context();
        debug_assert!(
            !std::ptr::eq(Arc::as_ptr(&current), self),
            "task waiting on itself"
        );
        if current.should_cancel() {
            return Err(current.wait_interrupted());
        }
        let strategy = FinishWaitStrategy {
            deadline,
            waiters: &self.finish_waiters,
            current: Arc::clone(&current),
            target: self,
        };
        current.sleep(&strategy);
        if !self.is_finished() && current.should_cancel() {
            return Err(current.wait_interrupted());
        }
        Ok(())
    }

    /// Body of one task run inside a coroutine frame; called by the frame
    /// trampoline with the transferred context.
    pub(crate) fn coro_func(task: *mut TaskContext, pipe: &TaskPipe) {
        let context = unsafe { &*task };
        let inner = context.inner();
        unsafe {
            (*inner).yield_reason = YieldReason::None;
            (*inner).task_pipe = Some(std::ptr::from_ref(pipe));
        }

        context.profiler_start_execution();

        // Only critical tasks get to enter the payload once cancelled;
        // everything else is terminated before it starts.
        if context.is_cancel_requested() && !context.started_as_critical() {
            context.set_cancellable_raw(false);
            // Drop the payload inside the coroutine: closure destructors may
            // want a current task to synchronize on.
            unsafe { (*inner).payload = None };
            unsafe { (*inner).yield_reason = YieldReason::TaskCancelled };
        } else {
            let payload = unsafe { (*inner).payload.take() };
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                context.trace_state_transition(TaskState::Running);
                if let Some(payload) = payload {
                    payload();
                }
            }));
            let reason = match outcome {
                Ok(()) => YieldReason::TaskComplete,
                Err(panic) => {
                    if panic.is::<CoroUnwind>() {
                        YieldReason::TaskCancelled
                    } else {
                        // Payloads are panic-wrapped at spawn; anything else
                        // reaching this frame is a runtime bug.
                        error!(
                            task_id = context.task_id,
                            "unexpected panic escaped a task payload"
                        );
                        debug_assert!(false, "unexpected panic escaped a task payload");
                        YieldReason::TaskCancelled
                    }
                }
            };
            unsafe { (*inner).yield_reason = reason };
        }

        context.profiler_stop_execution();
        unsafe {
            // An unwound sleep never restored the strategy chain; the
            // pointers lead into the stack that was just torn down.
            (*inner).wait_strategy = None;
            (*inner).task_pipe = None;
        }
    }

    fn set_state(&self, new_state: TaskState) {
        match new_state {
            TaskState::Running => {
                debug_assert!(current::is_current(self));
                debug_assert_eq!(self.state.load(Ordering::Relaxed), TaskState::Queued);
                // Other threads may briefly see Queued; the next
                // synchronization point covers them.
                self.state.store(TaskState::Running, Ordering::Relaxed);
            }
            TaskState::Suspended => {
                debug_assert_eq!(self.state.load(Ordering::Relaxed), TaskState::Running);
                // Synchronization point is the sleep-state fetch_or in step.
                self.state.store(TaskState::Suspended, Ordering::Relaxed);
            }
            TaskState::Completed | TaskState::Cancelled => {
                // Strong CAS so transitions into a terminal state cannot be
                // lost and finish waiters are woken exactly once.
                let mut observed = TaskState::Running;
                loop {
                    match self.state.compare_exchange(observed, new_state) {
                        Ok(_) => break,
                        Err(now) => {
                            if now.is_finished() {
                                // Someone else finished the task; leave it.
                                return;
                            }
                            observed = now;
                        }
                    }
                }
                if new_state == TaskState::Completed {
                    self.counter_token.counter().account_completed();
                }
                self.finish_waiters.lock().wake_all();
            }
            TaskState::New | TaskState::Queued | TaskState::Invalid => {
                debug_assert!(false, "invalid target state {}", new_state.name());
            }
        }
    }

    fn profiler_start_execution(&self) {
        unsafe { (*self.inner()).execute_started = Some(Instant::now()) };
    }

    fn profiler_stop_execution(&self) {
        let Some(started) = (unsafe { (*self.inner()).execute_started.take() }) else {
            return;
        };
        let elapsed = started.elapsed();
        self.counter_token.counter().account_execution(elapsed);
        let threshold = self
            .processor
            .upgrade()
            .and_then(|processor| processor.config().profiler_threshold);
        if let Some(threshold) = threshold {
            if elapsed >= threshold {
                let backtrace = std::backtrace::Backtrace::capture();
                error!(
                    task_id = self.task_id,
                    elapsed_us = elapsed.as_micros() as u64,
                    threshold_us = threshold.as_micros() as u64,
                    %backtrace,
                    "task ran too long without a context switch"
                );
            }
        }
    }

    fn trace_state_transition(&self, state: TaskState) {
        let mut left = self.trace_csw_left.load(Ordering::Relaxed);
        loop {
            if left == 0 {
                return;
            }
            match self.trace_csw_left.compare_exchange_weak(
                left,
                left - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(now) => left = now,
            }
        }
        let now = Instant::now();
        let delay_us = {
            let mut last = self.last_state_change.lock();
            let delay = last.map_or(0, |previous| {
                u64::try_from((now - previous).as_micros()).unwrap_or(u64::MAX)
            });
            *last = Some(now);
            delay
        };
        trace!(
            task_id = self.task_id,
            state = state.name(),
            delay_us,
            "task changed state"
        );
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        trace!(task_id = self.task_id, "task stopped");
        if self.inner.get_mut().coroutine.is_some() {
            // Reachable when the runtime is torn down around a still-live
            // suspended task: its stack is freed without running the
            // destructors parked on it.
            warn!(
                task_id = self.task_id,
                "dropping a suspended task with a live coroutine stack"
            );
        }
    }
}

/// Publishes the task as the thread's current task for one step; restores on
/// every exit path, including unwind.
struct CurrentTaskScope;

impl CurrentTaskScope {
    fn new(context: &TaskContext) -> Self {
        current::set_current(std::ptr::from_ref(context));
        Self
    }
}

impl Drop for CurrentTaskScope {
    fn drop(&mut self) {
        current::set_current(std::ptr::null());
    }
}

/// Registers the waiter on the target's finish list after parking; closes
/// the append-vs-finish race by self-waking when the target is already done.
struct FinishWaitStrategy<'a> {
    deadline: Deadline,
    waiters: &'a WaitList,
    current: Arc<TaskContext>,
    target: &'a TaskContext,
}

impl WaitStrategy for FinishWaitStrategy<'_> {
    fn deadline(&self) -> Deadline {
        self.deadline
    }

    fn after_asleep(&self) {
        let mut guard = self.waiters.lock();
        guard.append(Arc::clone(&self.current));
        if self.target.is_finished() {
            guard.wake_all();
        }
    }

    fn before_awake(&self) {}

    fn wait_list(&self) -> Option<&WaitList> {
        Some(self.waiters)
    }
}
