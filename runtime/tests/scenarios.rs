// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scheduler scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use weft::{CmdBufStatus, Pool, PoolConfig, WakeFilter, task};

fn pool(workers: usize) -> Pool {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();

    Pool::new(PoolConfig {
        worker_count: workers,
        ..PoolConfig::default()
    })
    .unwrap()
}

fn addr_of<T>(value: &T) -> *const () {
    std::ptr::from_ref(value).cast()
}

/// Task A parks on an address, task B publishes a new value and wakes it.
#[test]
fn ping_pong_wait_and_wake() {
    let pool = pool(2);
    let word = Arc::new(AtomicU32::new(0));
    let a_woke = Arc::new(AtomicBool::new(false));

    let mut buf = pool.command_buffer();

    buf.spawn({
        let word = Arc::clone(&word);
        let a_woke = Arc::clone(&a_woke);
        move || {
            while word.load(Ordering::Acquire) == 0 {
                // Safety: the word outlives both tasks.
                let res = unsafe { task::wait(addr_of(&*word), 4, 0, None) };
                assert_eq!(res, Ok(()));
            }
            a_woke.store(true, Ordering::Release);
        }
    });

    buf.spawn({
        let word = Arc::clone(&word);
        let wake_pool = pool.clone();
        move || {
            word.store(1, Ordering::Release);
            wake_pool.futex().wake(addr_of(&*word), 1, WakeFilter::Any);
        }
    });

    let status = pool.enqueue(buf).unwrap().join();
    assert_eq!(status, CmdBufStatus::Completed);
    assert!(a_woke.load(Ordering::Acquire));

    // every wait entry has been consumed again
    assert!(pool.futex().is_empty());
}

/// Cancelling a buffer of yield-looping tasks stops each of them at its next
/// suspension point, and join returns promptly.
#[test]
fn cancelled_join_returns_promptly() {
    let pool = pool(2);
    let observed = Arc::new(AtomicUsize::new(0));

    let mut buf = pool.command_buffer();
    for _ in 0..8 {
        let observed = Arc::clone(&observed);
        buf.spawn(move || {
            loop {
                task::yield_now();
                if task::cancel_requested() {
                    observed.fetch_add(1, Ordering::AcqRel);
                    return;
                }
            }
        });
    }

    let handle = pool.enqueue(buf).unwrap();
    handle.cancel();

    let start = Instant::now();
    let status = handle.join();
    assert_eq!(status, CmdBufStatus::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(observed.load(Ordering::Acquire), 8);
}

/// A sleeping task resumes at or after its deadline.
#[test]
fn sleep_respects_deadline() {
    let pool = pool(1);
    let elapsed_ms = Arc::new(AtomicU32::new(0));

    let mut buf = pool.command_buffer();
    buf.spawn({
        let elapsed_ms = Arc::clone(&elapsed_ms);
        move || {
            let start = Instant::now();
            task::sleep(Duration::from_millis(10));
            let elapsed = u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX);
            elapsed_ms.store(elapsed, Ordering::Release);
        }
    });

    pool.enqueue(buf).unwrap().join();

    let elapsed = elapsed_ms.load(Ordering::Acquire);
    assert!(elapsed >= 10, "task resumed after {elapsed}ms");
    assert!(elapsed < 5_000, "timer granularity blew up: {elapsed}ms");
}

/// A wait with a deadline times out when nobody wakes the address.
#[test]
fn wait_times_out() {
    let pool = pool(1);
    let timed_out = Arc::new(AtomicBool::new(false));
    let word = Arc::new(AtomicU32::new(0));

    let mut buf = pool.command_buffer();
    buf.spawn({
        let timed_out = Arc::clone(&timed_out);
        let word = Arc::clone(&word);
        move || {
            let deadline = Instant::now() + Duration::from_millis(20);
            // Safety: the word outlives the task.
            let res = unsafe { task::wait(addr_of(&*word), 4, 0, Some(deadline)) };
            timed_out.store(res == Err(weft::Error::Timeout), Ordering::Release);
        }
    });

    pool.enqueue(buf).unwrap().join();
    assert!(timed_out.load(Ordering::Acquire));
    assert!(pool.futex().is_empty());
}

/// Producer tasks feed one consumer task through the unbounded channel until
/// close; nothing is lost or duplicated.
#[test]
fn channel_stress_between_tasks() {
    const PRODUCERS: usize = 8;
    const MSGS: usize = 500;

    let pool = pool(4);
    let futex = Arc::new(weft::Futex::new());
    let (tx, rx) = weft::channel::unbounded::channel::<usize>(futex);

    let produced = Arc::new(AtomicUsize::new(0));
    let mut buf = pool.command_buffer();

    // The single producer side lives on one task; the other producer tasks
    // feed it through an atomic counter to keep the channel's cardinality.
    buf.spawn({
        let produced = Arc::clone(&produced);
        move || {
            for i in 0..PRODUCERS * MSGS {
                tx.send(i).unwrap();
                produced.fetch_add(1, Ordering::AcqRel);
                if i % 64 == 0 {
                    task::yield_now();
                }
            }
            // tx drops here, closing the channel
        }
    });

    let received = Arc::new(AtomicUsize::new(0));
    let seen_sum = Arc::new(AtomicUsize::new(0));
    buf.spawn({
        let received = Arc::clone(&received);
        let seen_sum = Arc::clone(&seen_sum);
        move || {
            loop {
                match rx.try_recv() {
                    Ok(value) => {
                        received.fetch_add(1, Ordering::AcqRel);
                        seen_sum.fetch_add(value, Ordering::AcqRel);
                    }
                    Err(weft::channel::TryRecvError::Empty) => task::yield_now(),
                    Err(weft::channel::TryRecvError::Closed) => break,
                }
            }
        }
    });

    pool.enqueue(buf).unwrap().join();

    let total = PRODUCERS * MSGS;
    assert_eq!(received.load(Ordering::Acquire), total);
    assert_eq!(
        seen_sum.load(Ordering::Acquire),
        total * (total - 1) / 2,
        "every message was received exactly once"
    );
}

/// Mutex-style requeue: one waiter wakes, the rest move to the second
/// address and only resume when it is woken.
#[test]
fn requeue_moves_parked_tasks() {
    const WAITERS: usize = 10;

    let pool = pool(2);
    let cv = Arc::new(AtomicU32::new(0));
    let mtx = Arc::new(AtomicU32::new(0));
    let resumed = Arc::new(AtomicUsize::new(0));

    let mut buf = pool.command_buffer();
    for _ in 0..WAITERS {
        let cv = Arc::clone(&cv);
        let resumed = Arc::clone(&resumed);
        buf.spawn(move || {
            // Safety: the words outlive the tasks.
            let res = unsafe { task::wait(addr_of(&*cv), 4, 0, None) };
            assert_eq!(res, Ok(()));
            resumed.fetch_add(1, Ordering::AcqRel);
        });
    }

    let handle = pool.enqueue(buf).unwrap();

    // wait until all tasks are parked on the condition address
    while pool.futex().len() < WAITERS {
        std::thread::yield_now();
    }

    // Safety: the words outlive the call.
    let requeued = unsafe {
        pool.futex()
            .requeue(
                addr_of(&*cv),
                addr_of(&*mtx),
                4,
                0,
                1,
                usize::MAX,
                WakeFilter::Any,
            )
            .unwrap()
    };
    assert_eq!(requeued.woken, 1);
    assert_eq!(requeued.requeued, WAITERS - 1);

    // exactly one task resumed; the rest are parked on the mutex address
    while resumed.load(Ordering::Acquire) < 1 {
        std::thread::yield_now();
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(resumed.load(Ordering::Acquire), 1);
    assert_eq!(pool.futex().len(), WAITERS - 1);

    // waking the mutex address releases the requeued tasks
    assert_eq!(
        pool.futex().wake(addr_of(&*mtx), usize::MAX, WakeFilter::Any),
        WAITERS - 1
    );

    handle.join();
    assert_eq!(resumed.load(Ordering::Acquire), WAITERS);
}

/// Task-local storage runs destructors when the task ends.
#[test]
fn task_locals_drop_with_the_task() {
    static KEY: weft::LocalKey = weft::LocalKey::new();
    static DROPPED: AtomicBool = AtomicBool::new(false);

    unsafe fn drop_flag(value: *mut ()) {
        // Safety: the value is the DROPPED flag.
        unsafe { (*value.cast::<AtomicBool>()).store(true, Ordering::Release) };
    }

    let pool = pool(1);
    let mut buf = pool.command_buffer();
    buf.spawn(|| {
        task::local_set(
            &KEY,
            std::ptr::from_ref(&DROPPED).cast_mut().cast(),
            Some(drop_flag),
        );
        assert!(task::local_get(&KEY).is_some());
        task::yield_now();
        // still visible after a suspension
        assert!(task::local_get(&KEY).is_some());
    });

    pool.enqueue(buf).unwrap().join();
    assert!(DROPPED.load(Ordering::Acquire));
}

/// An aborting task marks its buffer as errored without tearing anything
/// else down.
#[test]
fn abort_surfaces_as_error() {
    let pool = pool(2);
    let survivor_ran = Arc::new(AtomicBool::new(false));

    let mut buf = pool.command_buffer();
    buf.spawn(|| {
        task::set_result(weft::Error::NotPermitted);
        task::abort();
    });
    buf.spawn({
        let survivor_ran = Arc::clone(&survivor_ran);
        move || {
            task::yield_now();
            survivor_ran.store(true, Ordering::Release);
        }
    });

    let handle = pool.enqueue(buf).unwrap();
    while !handle.is_completed() {
        std::thread::yield_now();
    }
    assert!(handle.has_errors());

    let status = handle.join();
    assert_eq!(status, CmdBufStatus::Completed);
    assert!(survivor_ran.load(Ordering::Acquire));
}

/// Joining from inside a task of the same pool parks the task, not the
/// worker thread.
#[test]
fn join_from_inside_a_task() {
    let pool = pool(1);
    let inner_done = Arc::new(AtomicBool::new(false));
    let outer_done = Arc::new(AtomicBool::new(false));

    let mut outer = pool.command_buffer();
    outer.spawn({
        let pool = pool.clone();
        let inner_done = Arc::clone(&inner_done);
        let outer_done = Arc::clone(&outer_done);
        move || {
            let mut inner = pool.command_buffer();
            inner.spawn({
                let inner_done = Arc::clone(&inner_done);
                move || {
                    task::yield_now();
                    inner_done.store(true, Ordering::Release);
                }
            });

            // With a single worker this can only complete if the join parks
            // the calling task cooperatively.
            let status = pool.enqueue(inner).unwrap().join();
            assert_eq!(status, CmdBufStatus::Completed);
            assert!(inner_done.load(Ordering::Acquire));
            outer_done.store(true, Ordering::Release);
        }
    });

    pool.enqueue(outer).unwrap().join();
    assert!(outer_done.load(Ordering::Acquire));
}
