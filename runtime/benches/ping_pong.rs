// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::atomic::{AtomicU32, Ordering};
use weft::{Pool, PoolConfig, WakeFilter, task};

fn pool(workers: usize) -> Pool {
    Pool::new(PoolConfig {
        worker_count: workers,
        ..PoolConfig::default()
    })
    .unwrap()
}

fn yield_10k_single_worker(c: &mut Criterion) {
    let pool = pool(1);

    const YIELDS: usize = 10_000;

    c.bench_function("yield_10k_single_worker", |b| {
        b.iter(|| {
            let mut buf = pool.command_buffer();
            buf.spawn(|| {
                for _ in 0..YIELDS {
                    task::yield_now();
                }
            });
            pool.enqueue(buf).unwrap().join();
        });
    });
}

fn yield_10k_two_tasks(c: &mut Criterion) {
    let pool = pool(1);

    const YIELDS: usize = 10_000;

    c.bench_function("yield_10k_two_tasks", |b| {
        b.iter(|| {
            let mut buf = pool.command_buffer();
            for _ in 0..2 {
                buf.spawn(|| {
                    for _ in 0..YIELDS {
                        task::yield_now();
                    }
                });
            }
            pool.enqueue(buf).unwrap().join();
        });
    });
}

fn futex_ping_pong_1k(c: &mut Criterion) {
    let pool = pool(2);

    const ROUNDS: u32 = 1_000;

    c.bench_function("futex_ping_pong_1k", |b| {
        b.iter(|| {
            let word = std::sync::Arc::new(AtomicU32::new(0));
            let mut buf = pool.command_buffer();

            for side in 0..2_u32 {
                let word = std::sync::Arc::clone(&word);
                let futex_pool = pool.clone();
                buf.spawn(move || {
                    for round in 0..ROUNDS {
                        let mine = round * 2 + side;
                        let addr = std::ptr::from_ref::<AtomicU32>(&word).cast();
                        while word.load(Ordering::Acquire) < mine {
                            let current = word.load(Ordering::Acquire);
                            // Safety: the word outlives the tasks.
                            let _ = unsafe {
                                task::wait(addr, 4, u64::from(current), None)
                            };
                        }
                        word.fetch_add(1, Ordering::AcqRel);
                        futex_pool.futex().wake(addr, 1, WakeFilter::Any);
                    }
                });
            }

            pool.enqueue(buf).unwrap().join();
        });
    });
}

criterion_group!(
    ping_pong,
    yield_10k_single_worker,
    yield_10k_two_tasks,
    futex_ping_pong_1k
);
criterion_main!(ping_pong);
