//! One-shot timers.

use super::EventThread;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A one-shot timer armed on an event thread.
///
/// The callback runs on the event thread once the duration elapses and must
/// not block. [`Timer::stop`] (or dropping the timer) cancels a pending
/// callback; a callback that already started is not interrupted.
#[derive(Debug)]
pub struct Timer {
    cancelled: Arc<AtomicBool>,
}

impl Timer {
    /// Arms a one-shot timer.
    #[must_use]
    pub fn new<F>(thread: Arc<EventThread>, callback: F, after: Duration) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now()
            .checked_add(after)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        thread.arm(deadline, Arc::clone(&cancelled), Box::new(callback));
        Self { cancelled }
    }

    /// Cancels the timer if it has not fired yet.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ev::EventThreadPool;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn timer_fires_once() {
        let pool = EventThreadPool::new(1, "test");
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(
            pool.next_thread(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
        );
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(timer);
    }

    #[test]
    fn stopped_timer_does_not_fire() {
        let pool = EventThreadPool::new(1, "test");
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(
            pool.next_thread(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        );
        timer.stop();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
