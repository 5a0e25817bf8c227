//! Bounded MP/SP × MC/SC value queues.
//!
//! A [`GenericQueue`] pairs a lock-free unbounded FIFO with two per-side
//! discipline objects chosen by the `(MP, MC)` flags: single-handle sides
//! use an atomic counter plus a [`SingleConsumerEvent`], multi-handle sides
//! a counting [`Semaphore`]. The queue itself is only a factory; work flows
//! through reference-counted [`Producer`] and [`Consumer`] handles whose
//! lifecycle drives end-of-stream:
//!
//! - dropping the last producer permanently unblocks consumers, which drain
//!   the remaining items and then observe emptiness without blocking;
//! - dropping the last consumer permanently unblocks producers, whose pushes
//!   fail immediately.
//!
//! The capacity limit is soft: concurrent pushes may overrun it briefly.

use crate::sync::{Semaphore, SingleConsumerEvent};
use crate::task::current;
use crate::time::Deadline;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Default capacity sentinel: effectively unbounded, leaving headroom for
/// the end-of-stream unlock arithmetic.
pub const UNBOUNDED: usize = usize::MAX / 2;

/// Handle-counter sentinel: the side was opened and every handle has since
/// been dropped. Terminal.
const CREATED_AND_DEAD: usize = usize::MAX;

/// Permits injected into the opposite side when a side dies, so it can
/// observe end-of-stream without blocking, forever.
const SEMAPHORE_UNLOCK_VALUE: usize = usize::MAX / 2;

/// Multi-producer, multi-consumer bounded queue.
pub type MpmcQueue<T> = GenericQueue<T, true, true>;
/// Multi-producer, single-consumer bounded queue.
pub type MpscQueue<T> = GenericQueue<T, true, false>;
/// Single-producer, multi-consumer bounded queue.
pub type SpmcQueue<T> = GenericQueue<T, false, true>;
/// Single-producer, single-consumer bounded queue.
pub type SpscQueue<T> = GenericQueue<T, false, false>;

#[derive(Debug)]
enum ProducerSide {
    Single {
        // Signed: a soft shrink may push it below zero until pops catch up.
        remaining_capacity: AtomicIsize,
        nonfull: SingleConsumerEvent,
    },
    Multi {
        remaining_capacity: Semaphore,
    },
}

impl ProducerSide {
    fn increase_capacity(&self, count: usize) {
        match self {
            Self::Single {
                remaining_capacity,
                nonfull,
            } => {
                remaining_capacity.fetch_add(count as isize, Ordering::SeqCst);
                nonfull.send();
            }
            Self::Multi { remaining_capacity } => remaining_capacity.release(count),
        }
    }

    fn decrease_capacity(&self, count: usize) {
        match self {
            Self::Single {
                remaining_capacity, ..
            } => {
                remaining_capacity.fetch_sub(count as isize, Ordering::SeqCst);
            }
            Self::Multi { remaining_capacity } => {
                // Blocks the caller while the queue is over the new limit.
                let _ = remaining_capacity.acquire_until(Deadline::unreachable(), count);
            }
        }
    }

    fn on_element_popped(&self) {
        match self {
            Self::Single {
                remaining_capacity,
                nonfull,
            } => {
                remaining_capacity.fetch_add(1, Ordering::SeqCst);
                nonfull.send();
            }
            Self::Multi { remaining_capacity } => remaining_capacity.release(1),
        }
    }

    fn on_consumers_dead(&self) {
        match self {
            Self::Single { nonfull, .. } => nonfull.send(),
            Self::Multi { remaining_capacity } => {
                remaining_capacity.release(SEMAPHORE_UNLOCK_VALUE);
            }
        }
    }
}

#[derive(Debug)]
enum ConsumerSide {
    Single {
        // Signed: a pop may be accounted before the racing push's increment.
        size: AtomicIsize,
        nonempty: SingleConsumerEvent,
    },
    Multi {
        size: Semaphore,
    },
}

impl ConsumerSide {
    fn on_element_pushed(&self) {
        match self {
            Self::Single { size, nonempty } => {
                size.fetch_add(1, Ordering::SeqCst);
                nonempty.send();
            }
            Self::Multi { size } => size.release(1),
        }
    }

    fn on_producers_dead(&self) {
        match self {
            Self::Single { nonempty, .. } => nonempty.send(),
            Self::Multi { size } => size.release(SEMAPHORE_UNLOCK_VALUE),
        }
    }

    fn size_approx(&self) -> usize {
        match self {
            Self::Single { size, .. } => size.load(Ordering::SeqCst).max(0) as usize,
            Self::Multi { size } => size.remaining_approx(),
        }
    }
}

/// A bounded value queue parameterised by producer/consumer multiplicity.
#[derive(Debug)]
pub struct GenericQueue<T, const MP: bool, const MC: bool> {
    // Queues are only ever shared; handles clone out of this.
    self_ref: Weak<Self>,
    inner: SegQueue<T>,
    capacity: AtomicUsize,
    producers_count: AtomicUsize,
    consumers_count: AtomicUsize,
    producer_side: ProducerSide,
    consumer_side: ConsumerSide,
}

impl<T: Send, const MP: bool, const MC: bool> GenericQueue<T, MP, MC> {
    /// Creates a queue with the given soft capacity.
    #[must_use]
    pub fn create(max_size: usize) -> Arc<Self> {
        let max_size = max_size.min(UNBOUNDED);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            inner: SegQueue::new(),
            capacity: AtomicUsize::new(max_size),
            producers_count: AtomicUsize::new(0),
            consumers_count: AtomicUsize::new(0),
            producer_side: if MP {
                ProducerSide::Multi {
                    remaining_capacity: Semaphore::new(max_size),
                }
            } else {
                ProducerSide::Single {
                    remaining_capacity: AtomicIsize::new(max_size as isize),
                    nonfull: SingleConsumerEvent::new(),
                }
            },
            consumer_side: if MC {
                ConsumerSide::Multi {
                    size: Semaphore::new(0),
                }
            } else {
                ConsumerSide::Single {
                    size: AtomicIsize::new(0),
                    nonempty: SingleConsumerEvent::new(),
                }
            },
        })
    }

    /// Creates an effectively unbounded queue.
    #[must_use]
    pub fn unbounded() -> Arc<Self> {
        Self::create(UNBOUNDED)
    }

    /// Opens a producer handle.
    ///
    /// # Panics
    ///
    /// Panics when the producer side is already closed (every previous
    /// handle dropped), or on a second handle for a single-producer queue.
    #[must_use]
    pub fn get_producer(&self) -> Producer<T, MP, MC> {
        let old = atomic_update(&self.producers_count, |count| {
            assert!(
                count != CREATED_AND_DEAD,
                "producer side of the queue is closed"
            );
            count + 1
        });
        assert!(
            MP || old == 0,
            "single-producer queue already has a producer handle"
        );
        Producer {
            queue: self.shared(),
        }
    }

    /// Opens a consumer handle.
    ///
    /// # Panics
    ///
    /// Panics when the consumer side is already closed, or on a second
    /// handle for a single-consumer queue.
    #[must_use]
    pub fn get_consumer(&self) -> Consumer<T, MP, MC> {
        let old = atomic_update(&self.consumers_count, |count| {
            assert!(
                count != CREATED_AND_DEAD,
                "consumer side of the queue is closed"
            );
            count + 1
        });
        assert!(
            MC || old == 0,
            "single-consumer queue already has a consumer handle"
        );
        Consumer {
            queue: self.shared(),
        }
    }

    /// Sets the soft capacity limit; pushes over it block.
    ///
    /// Shrinking below the current size may block the caller until
    /// consumers catch up. The limit is soft: it can be briefly overrun
    /// under concurrent pushes.
    pub fn set_soft_max_size(&self, max_size: usize) {
        let max_size = max_size.min(UNBOUNDED);
        let old_capacity = self.capacity.swap(max_size, Ordering::SeqCst);
        if max_size > old_capacity {
            self.producer_side.increase_capacity(max_size - old_capacity);
        } else if max_size < old_capacity {
            self.producer_side.decrease_capacity(old_capacity - max_size);
        }
    }

    /// The current soft capacity limit.
    #[must_use]
    pub fn soft_max_size(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Approximate number of queued items.
    #[must_use]
    pub fn size_approx(&self) -> usize {
        self.consumer_side.size_approx()
    }

    fn shared(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("queue used after its Arc was gone")
    }

    fn no_more_producers(&self) -> bool {
        self.producers_count.load(Ordering::SeqCst) == CREATED_AND_DEAD
    }

    fn no_more_consumers(&self) -> bool {
        self.consumers_count.load(Ordering::SeqCst) == CREATED_AND_DEAD
    }

    fn mark_producer_dead(&self) {
        let old = atomic_update(&self.producers_count, |count| {
            if count == 1 {
                CREATED_AND_DEAD
            } else {
                count - 1
            }
        });
        if old == 1 {
            self.consumer_side.on_producers_dead();
        }
    }

    fn mark_consumer_dead(&self) {
        let old = atomic_update(&self.consumers_count, |count| {
            if count == 1 {
                CREATED_AND_DEAD
            } else {
                count - 1
            }
        });
        if old == 1 {
            self.producer_side.on_consumers_dead();
        }
    }

    fn push(&self, value: T, deadline: Deadline) -> Result<(), T> {
        match &self.producer_side {
            ProducerSide::Single { nonfull, .. } => match self.do_push_single(value) {
                Ok(()) => Ok(()),
                Err(value) => {
                    if self.no_more_consumers() {
                        return Err(value);
                    }
                    if nonfull.wait_until(deadline) {
                        self.do_push_single(value)
                    } else {
                        Err(value)
                    }
                }
            },
            ProducerSide::Multi { remaining_capacity } => {
                if current::should_cancel_unchecked() {
                    return Err(value);
                }
                if !remaining_capacity.acquire_until(deadline, 1) {
                    return Err(value);
                }
                self.do_push_multi(value)
            }
        }
    }

    fn push_noblock(&self, value: T) -> Result<(), T> {
        match &self.producer_side {
            ProducerSide::Single { .. } => self.do_push_single(value),
            ProducerSide::Multi { remaining_capacity } => {
                if !remaining_capacity.try_acquire(1) {
                    return Err(value);
                }
                self.do_push_multi(value)
            }
        }
    }

    fn do_push_single(&self, value: T) -> Result<(), T> {
        let ProducerSide::Single {
            remaining_capacity,
            nonfull,
        } = &self.producer_side
        else {
            unreachable!()
        };
        if self.no_more_consumers() || remaining_capacity.load(Ordering::SeqCst) <= 0 {
            return Err(value);
        }
        remaining_capacity.fetch_sub(1, Ordering::SeqCst);
        self.inner.push(value);
        nonfull.reset();
        self.consumer_side.on_element_pushed();
        Ok(())
    }

    /// Multi-producer commit; the caller holds one capacity permit.
    fn do_push_multi(&self, value: T) -> Result<(), T> {
        let ProducerSide::Multi { remaining_capacity } = &self.producer_side else {
            unreachable!()
        };
        if self.no_more_consumers() {
            remaining_capacity.release(1);
            return Err(value);
        }
        self.inner.push(value);
        self.consumer_side.on_element_pushed();
        Ok(())
    }

    fn pop(&self, deadline: Deadline) -> Option<T> {
        match &self.consumer_side {
            ConsumerSide::Single { nonempty, .. } => {
                if let Some(value) = self.do_pop_single() {
                    return Some(value);
                }
                // A dead producer side means no new elements can appear; a
                // final non-blocking pop drains whatever is left.
                if self.no_more_producers() || nonempty.wait_until(deadline) {
                    return self.do_pop_single();
                }
                None
            }
            ConsumerSide::Multi { size } => {
                if !size.acquire_until(deadline, 1) {
                    return None;
                }
                self.do_pop_multi()
            }
        }
    }

    fn pop_noblock(&self) -> Option<T> {
        match &self.consumer_side {
            ConsumerSide::Single { .. } => self.do_pop_single(),
            ConsumerSide::Multi { size } => {
                if !size.try_acquire(1) {
                    return None;
                }
                self.do_pop_multi()
            }
        }
    }

    fn do_pop_single(&self) -> Option<T> {
        let ConsumerSide::Single { size, nonempty } = &self.consumer_side else {
            unreachable!()
        };
        let value = self.inner.pop()?;
        size.fetch_sub(1, Ordering::SeqCst);
        nonempty.reset();
        self.producer_side.on_element_popped();
        Some(value)
    }

    /// Multi-consumer commit; the caller holds one size permit.
    fn do_pop_multi(&self) -> Option<T> {
        let ConsumerSide::Multi { size } = &self.consumer_side else {
            unreachable!()
        };
        match self.inner.pop() {
            Some(value) => {
                self.producer_side.on_element_popped();
                Some(value)
            }
            None => {
                // Lost the race against the drain: the permit came from the
                // end-of-stream unlock, not an element.
                size.release(1);
                None
            }
        }
    }
}

impl<T, const MP: bool, const MC: bool> Drop for GenericQueue<T, MP, MC> {
    fn drop(&mut self) {
        while self.inner.pop().is_some() {}
        let producers = self.producers_count.load(Ordering::SeqCst);
        let consumers = self.consumers_count.load(Ordering::SeqCst);
        debug_assert!(
            producers == 0 || producers == CREATED_AND_DEAD,
            "queue dropped with live producers"
        );
        debug_assert!(
            consumers == 0 || consumers == CREATED_AND_DEAD,
            "queue dropped with live consumers"
        );
    }
}

/// Read-modify-write loop; returns the previous value.
fn atomic_update(cell: &AtomicUsize, update: impl Fn(usize) -> usize) -> usize {
    let mut current = cell.load(Ordering::SeqCst);
    loop {
        let new = update(current);
        match cell.compare_exchange_weak(current, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return current,
            Err(now) => current = now,
        }
    }
}

/// A reference-counted producer view of a queue.
///
/// Keeps the producer side alive; dropping the last producer closes the
/// side and lets consumers observe end-of-stream.
#[derive(Debug)]
pub struct Producer<T: Send, const MP: bool, const MC: bool> {
    queue: Arc<GenericQueue<T, MP, MC>>,
}

impl<T: Send, const MP: bool, const MC: bool> Producer<T, MP, MC> {
    /// Pushes `value`, blocking while the queue is over capacity, up to
    /// `deadline`. On failure the value is handed back.
    ///
    /// Fails immediately when no consumers remain.
    pub fn push(&self, value: T, deadline: Deadline) -> Result<(), T> {
        self.queue.push(value, deadline)
    }

    /// Pushes `value` without blocking.
    pub fn push_noblock(&self, value: T) -> Result<(), T> {
        self.queue.push_noblock(value)
    }
}

impl<T: Send, const MP: bool, const MC: bool> Drop for Producer<T, MP, MC> {
    fn drop(&mut self) {
        self.queue.mark_producer_dead();
    }
}

/// A reference-counted consumer view of a queue.
///
/// Keeps the consumer side alive; dropping the last consumer closes the
/// side and makes producer pushes fail immediately.
#[derive(Debug)]
pub struct Consumer<T: Send, const MP: bool, const MC: bool> {
    queue: Arc<GenericQueue<T, MP, MC>>,
}

impl<T: Send, const MP: bool, const MC: bool> Consumer<T, MP, MC> {
    /// Pops a value, blocking while the queue is empty and producers remain,
    /// up to `deadline`.
    ///
    /// After the last producer dies, drains the remaining items and then
    /// returns `None` without blocking.
    pub fn pop(&self, deadline: Deadline) -> Option<T> {
        self.queue.pop(deadline)
    }

    /// Pops a value without blocking.
    pub fn pop_noblock(&self) -> Option<T> {
        self.queue.pop_noblock()
    }
}

impl<T: Send, const MP: bool, const MC: bool> Drop for Consumer<T, MP, MC> {
    fn drop(&mut self) {
        self.queue.mark_consumer_dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noblock_round_trip() {
        let queue = MpmcQueue::<u32>::create(4);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();
        assert!(producer.push_noblock(7).is_ok());
        assert_eq!(queue.size_approx(), 1);
        assert_eq!(consumer.pop_noblock(), Some(7));
        assert_eq!(consumer.pop_noblock(), None);
    }

    #[test]
    fn capacity_bounds_noblock_pushes() {
        let queue = MpmcQueue::<u32>::create(2);
        let producer = queue.get_producer();
        let _consumer = queue.get_consumer();
        assert!(producer.push_noblock(1).is_ok());
        assert!(producer.push_noblock(2).is_ok());
        assert_eq!(producer.push_noblock(3), Err(3));
    }

    #[test]
    fn spsc_capacity_bounds_noblock_pushes() {
        let queue = SpscQueue::<u32>::create(1);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();
        assert!(producer.push_noblock(1).is_ok());
        assert_eq!(producer.push_noblock(2), Err(2));
        assert_eq!(consumer.pop_noblock(), Some(1));
        assert!(producer.push_noblock(2).is_ok());
    }

    #[test]
    fn growing_capacity_frees_pushes() {
        let queue = MpmcQueue::<u32>::create(1);
        let producer = queue.get_producer();
        let _consumer = queue.get_consumer();
        assert!(producer.push_noblock(1).is_ok());
        assert_eq!(producer.push_noblock(2), Err(2));
        queue.set_soft_max_size(3);
        assert_eq!(queue.soft_max_size(), 3);
        assert!(producer.push_noblock(2).is_ok());
        assert!(producer.push_noblock(3).is_ok());
        assert_eq!(producer.push_noblock(4), Err(4));
    }

    #[test]
    fn push_fails_after_consumers_die() {
        let queue = MpmcQueue::<u32>::create(4);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();
        drop(consumer);
        assert_eq!(producer.push_noblock(1), Err(1));
    }

    #[test]
    fn pop_drains_after_producers_die() {
        let queue = MpmcQueue::<u32>::create(4);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();
        assert!(producer.push_noblock(1).is_ok());
        assert!(producer.push_noblock(2).is_ok());
        drop(producer);
        assert_eq!(consumer.pop_noblock(), Some(1));
        assert_eq!(consumer.pop_noblock(), Some(2));
        assert_eq!(consumer.pop_noblock(), None);
    }

    #[test]
    #[should_panic(expected = "single-producer queue already has a producer handle")]
    fn second_single_producer_handle_panics() {
        let queue = SpscQueue::<u32>::create(4);
        let _first = queue.get_producer();
        let _second = queue.get_producer();
    }

    #[test]
    #[should_panic(expected = "producer side of the queue is closed")]
    fn reopening_a_dead_side_panics() {
        let queue = MpmcQueue::<u32>::create(4);
        drop(queue.get_producer());
        let _reopened = queue.get_producer();
    }

    #[test]
    fn multiple_mp_handles_share_the_side() {
        let queue = MpscQueue::<u32>::create(8);
        let first = queue.get_producer();
        let second = queue.get_producer();
        let consumer = queue.get_consumer();
        assert!(first.push_noblock(1).is_ok());
        assert!(second.push_noblock(2).is_ok());
        drop(first);
        // One producer still alive: not end-of-stream yet.
        assert_eq!(consumer.pop_noblock(), Some(1));
        assert_eq!(consumer.pop_noblock(), Some(2));
        assert_eq!(consumer.pop_noblock(), None);
        drop(second);
        assert_eq!(consumer.pop_noblock(), None);
    }
}
