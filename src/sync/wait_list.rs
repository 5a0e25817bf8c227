//! Wait lists: parked tasks waiting on a synchronisation primitive.
//!
//! A [`WaitList`] is a short-lock-protected list of task contexts. The
//! canonical use holds at most one waiter (a task waiting for another task
//! to finish); the same structure chains multiple waiters for the counting
//! semaphore. The contract that matters is ordering: a waiter appended
//! before a wake call observes that wake, because both run under the list
//! lock and the wake itself is a seq_cst sleep-state update.

use crate::task::TaskContext;
use crate::task::WakeupSource;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct WaitList {
    waiters: Mutex<VecDeque<Arc<TaskContext>>>,
}

impl WaitList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> WaitListGuard<'_> {
        WaitListGuard {
            waiters: self.waiters.lock(),
        }
    }

    /// Removes `task` if it is still parked here.
    ///
    /// Called by the awakened task itself when its wakeup came from another
    /// source (deadline timer, cancellation) and the registration would
    /// otherwise dangle.
    pub(crate) fn remove(&self, task: &TaskContext) {
        let target = std::ptr::from_ref(task);
        self.waiters
            .lock()
            .retain(|waiter| !std::ptr::eq(Arc::as_ptr(waiter), target));
    }
}

pub(crate) struct WaitListGuard<'a> {
    waiters: MutexGuard<'a, VecDeque<Arc<TaskContext>>>,
}

impl WaitListGuard<'_> {
    /// Registers `task` as a waiter.
    pub(crate) fn append(&mut self, task: Arc<TaskContext>) {
        debug_assert!(
            !self
                .waiters
                .iter()
                .any(|waiter| Arc::ptr_eq(waiter, &task)),
            "task appended to the same wait list twice"
        );
        self.waiters.push_back(task);
    }

    /// Wakes the earliest waiter, if any. Returns true if one was woken.
    pub(crate) fn wake_one(&mut self) -> bool {
        match self.waiters.pop_front() {
            Some(waiter) => {
                waiter.wakeup(WakeupSource::WaitList);
                true
            }
            None => false,
        }
    }

    /// Wakes every parked waiter.
    pub(crate) fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.wakeup(WakeupSource::WaitList);
        }
    }
}
