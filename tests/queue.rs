//! End-to-end queue behaviour: blocking paths, capacity, handle lifecycle.

mod common;

use common::test_processor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::{current_task, spawn, Deadline, Importance, MpmcQueue, SpmcQueue, SpscQueue};

#[test]
fn single_producer_stream_is_fifo() {
    let processor = test_processor(2);
    let received = processor.run_blocking(|| {
        let processor = current_task::processor();
        let queue = SpscQueue::<u32>::create(4);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();

        let pusher = spawn(&processor, Importance::Normal, move || {
            for i in 0..100u32 {
                producer
                    .push(i, Deadline::unreachable())
                    .expect("consumer vanished");
            }
        })
        .expect("spawn producer");

        let popper = spawn(&processor, Importance::Normal, move || {
            let mut received = Vec::new();
            while let Some(value) = consumer.pop(Deadline::unreachable()) {
                received.push(value);
            }
            received
        })
        .expect("spawn consumer");

        pusher.get().expect("producer failed");
        popper.get().expect("consumer failed")
    });
    let expected: Vec<u32> = (0..100).collect();
    assert_eq!(received, expected);
}

#[test]
fn full_queue_blocks_until_deadline_or_space() {
    // A full queue fails a short-deadline push, then admits it once a
    // consumer frees a slot.
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let queue = MpmcQueue::<u32>::create(2);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();

        assert!(producer.push(1, Deadline::unreachable()).is_ok());
        assert!(producer.push(2, Deadline::unreachable()).is_ok());

        let started = Instant::now();
        let rejected = producer.push(3, Deadline::from_duration(Duration::from_millis(40)));
        assert_eq!(rejected, Err(3));
        assert!(started.elapsed() >= Duration::from_millis(30));

        assert_eq!(consumer.pop(Deadline::unreachable()), Some(1));
        assert!(producer
            .push(3, Deadline::from_duration(Duration::from_millis(500)))
            .is_ok());
        assert_eq!(consumer.pop(Deadline::unreachable()), Some(2));
        assert_eq!(consumer.pop(Deadline::unreachable()), Some(3));
    });
}

#[test]
fn contended_producers_respect_the_soft_capacity() {
    // Three producers against capacity 2 and a slow consumer; every pushed
    // item is eventually observed and the in-flight count stays within
    // capacity plus the number of concurrent pushers.
    let processor = test_processor(4);
    const PER_PRODUCER: usize = 20;
    let max_seen = Arc::new(AtomicUsize::new(0));
    let peak = Arc::clone(&max_seen);
    let popped = processor.run_blocking(move || {
        let processor = current_task::processor();
        let queue = MpmcQueue::<usize>::create(2);
        let consumer = queue.get_consumer();

        let producers: Vec<_> = (0..3)
            .map(|p| {
                let producer = queue.get_producer();
                let watched_queue = Arc::clone(&queue);
                let peak = Arc::clone(&peak);
                spawn(&processor, Importance::Normal, move || {
                    let mut pushed = 0;
                    for i in 0..PER_PRODUCER {
                        if producer
                            .push(p * PER_PRODUCER + i, Deadline::unreachable())
                            .is_ok()
                        {
                            pushed += 1;
                            // Sampled while this producer handle is alive, so
                            // the count is not inflated by end-of-stream
                            // unlock permits.
                            peak.fetch_max(watched_queue.size_approx(), Ordering::SeqCst);
                        }
                    }
                    pushed
                })
                .expect("spawn producer")
            })
            .collect();

        let popper = spawn(&processor, Importance::Normal, move || {
            let mut popped = 0;
            while consumer.pop(Deadline::unreachable()).is_some() {
                popped += 1;
                current_task::sleep_for(Duration::from_millis(1));
            }
            popped
        })
        .expect("spawn consumer");

        let mut pushed_total = 0;
        for producer in producers {
            pushed_total += producer.get().expect("producer failed");
        }
        drop(queue);
        let popped = popper.get().expect("consumer failed");
        assert_eq!(pushed_total, 3 * PER_PRODUCER);
        popped
    });
    assert_eq!(popped, 3 * PER_PRODUCER);
    assert!(
        max_seen.load(Ordering::SeqCst) <= 2 + 3,
        "soft capacity exceeded beyond in-flight pushes: {}",
        max_seen.load(Ordering::SeqCst)
    );
}

#[test]
fn producer_death_drains_then_unblocks_consumer() {
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let queue = SpscQueue::<u32>::create(8);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();

        for i in 0..5 {
            producer.push(i, Deadline::unreachable()).expect("push");
        }
        drop(producer);

        for i in 0..5 {
            assert_eq!(consumer.pop(Deadline::unreachable()), Some(i));
        }
        let started = Instant::now();
        assert_eq!(consumer.pop(Deadline::unreachable()), None);
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "end-of-stream pop blocked"
        );
    });
}

#[test]
fn consumer_death_unblocks_a_parked_producer() {
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let processor = current_task::processor();
        let queue = SpscQueue::<u32>::create(1);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();

        let second_push_done = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&second_push_done);
        let pusher = spawn(&processor, Importance::Normal, move || {
            producer.push(1, Deadline::unreachable()).expect("push");
            // Queue is full; this parks until the consumer drops.
            let rejected = producer.push(2, Deadline::unreachable());
            done.store(true, Ordering::SeqCst);
            rejected
        })
        .expect("spawn producer");

        current_task::sleep_for(Duration::from_millis(100));
        assert!(!second_push_done.load(Ordering::SeqCst));

        let dropped_at = Instant::now();
        drop(consumer);
        let rejected = pusher.get().expect("producer failed");
        assert_eq!(rejected, Err(2));
        assert!(
            dropped_at.elapsed() < Duration::from_secs(2),
            "producer stayed parked after consumer death"
        );
    });
}

#[test]
fn push_after_consumer_death_fails_immediately() {
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let queue = MpmcQueue::<u32>::create(1);
        let producer = queue.get_producer();
        drop(queue.get_consumer());

        let started = Instant::now();
        assert_eq!(producer.push(1, Deadline::unreachable()), Err(1));
        assert_eq!(producer.push(2, Deadline::unreachable()), Err(2));
        assert!(started.elapsed() < Duration::from_secs(2));
    });
}

#[test]
fn empty_queue_pop_times_out() {
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let queue = MpmcQueue::<u32>::create(4);
        let _producer = queue.get_producer();
        let consumer = queue.get_consumer();

        let started = Instant::now();
        let value = consumer.pop(Deadline::from_duration(Duration::from_millis(50)));
        assert_eq!(value, None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "pop returned early");
        assert!(elapsed < Duration::from_secs(2));
    });
}

#[test]
fn two_consumers_share_the_drain() {
    let processor = test_processor(4);
    let total = processor.run_blocking(|| {
        let processor = current_task::processor();
        let queue = SpmcQueue::<u32>::create(64);
        let producer = queue.get_producer();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let consumer = queue.get_consumer();
                spawn(&processor, Importance::Normal, move || {
                    let mut values = Vec::new();
                    while let Some(value) = consumer.pop(Deadline::unreachable()) {
                        values.push(value);
                    }
                    values
                })
                .expect("spawn consumer")
            })
            .collect();

        for i in 0..40u32 {
            producer.push(i, Deadline::unreachable()).expect("push");
        }
        drop(producer);

        let mut all: Vec<u32> = consumers
            .into_iter()
            .flat_map(|consumer| consumer.get().expect("consumer failed"))
            .collect();
        all.sort_unstable();
        all
    });
    let expected: Vec<u32> = (0..40).collect();
    assert_eq!(total, expected);
}

#[test]
fn shrinking_below_size_blocks_until_pops() {
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let processor = current_task::processor();
        let queue = MpmcQueue::<u32>::create(4);
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();

        for i in 0..4 {
            producer.push(i, Deadline::unreachable()).expect("push");
        }

        let shrink_queue = Arc::clone(&queue);
        let shrink_done = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&shrink_done);
        let shrinker = spawn(&processor, Importance::Normal, move || {
            shrink_queue.set_soft_max_size(2);
            done.store(true, Ordering::SeqCst);
        })
        .expect("spawn shrinker");

        current_task::sleep_for(Duration::from_millis(100));
        assert!(
            !shrink_done.load(Ordering::SeqCst),
            "shrink below size did not block"
        );

        assert_eq!(consumer.pop(Deadline::unreachable()), Some(0));
        assert_eq!(consumer.pop(Deadline::unreachable()), Some(1));
        shrinker.get().expect("shrinker failed");
        assert_eq!(queue.soft_max_size(), 2);

        // At the new limit: full again.
        assert_eq!(producer.push_noblock(9), Err(9));
        assert_eq!(consumer.pop(Deadline::unreachable()), Some(2));
        assert!(producer.push_noblock(9).is_ok());
    });
}

#[test]
fn growing_capacity_unblocks_parked_producers() {
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let processor = current_task::processor();
        let queue = MpmcQueue::<u32>::create(1);
        let producer = queue.get_producer();
        let _consumer = queue.get_consumer();

        producer.push(1, Deadline::unreachable()).expect("push");

        let grow_queue = Arc::clone(&queue);
        let grower = spawn(&processor, Importance::Normal, move || {
            current_task::sleep_for(Duration::from_millis(50));
            grow_queue.set_soft_max_size(4);
        })
        .expect("spawn grower");

        // Parks on the full queue until the grower raises the limit.
        assert!(producer
            .push(2, Deadline::from_duration(Duration::from_secs(5)))
            .is_ok());
        grower.get().expect("grower failed");
    });
}

#[test]
fn unbounded_queue_accepts_bursts() {
    let processor = test_processor(2);
    processor.run_blocking(|| {
        let queue = MpmcQueue::<usize>::unbounded();
        let producer = queue.get_producer();
        let consumer = queue.get_consumer();
        for i in 0..10_000 {
            producer.push_noblock(i).expect("unbounded push");
        }
        assert_eq!(queue.size_approx(), 10_000);
        let mut count = 0;
        while consumer.pop_noblock().is_some() {
            count += 1;
        }
        assert_eq!(count, 10_000);
    });
}
