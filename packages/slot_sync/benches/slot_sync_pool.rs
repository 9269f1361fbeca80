//! Benchmarks for `Pool` donate/take cycles and for `Promise` resolution.
#![expect(missing_docs, reason = "No need for API documentation in benchmark code")]

use std::hint::black_box;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};
use slot_sync::{Pool, Promise};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const POOL_CAPACITY: usize = 32;
const CONTENDING_THREADS: usize = 4;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_sync_pool");

    group.bench_function("donate_take", |b| {
        let pool = Pool::<Vec<u8>>::new(POOL_CAPACITY);

        b.iter(|| {
            pool.donate(Vec::new());
            black_box(pool.try_get());
        });
    });

    group.bench_function("donate_with_recycler", |b| {
        let pool = Pool::builder(POOL_CAPACITY)
            .recycler(|buffer: &mut Vec<u8>| {
                buffer.clear();
                Ok(())
            })
            .build();

        b.iter(|| {
            let mut buffer = pool.get_or_else(|| Vec::with_capacity(1024));
            buffer.push(1);
            pool.donate(buffer);
        });
    });

    group.bench_function("donate_to_full", |b| {
        let pool = Pool::<u64>::new(1);
        pool.donate(0);

        b.iter(|| pool.donate(black_box(1)));
    });

    group.bench_function("donate_take_contended", |b| {
        b.iter_custom(contended_cycles);
    });

    group.bench_function("promise_resolve_release", |b| {
        let (promise, promised) = Promise::<u32>::pending();

        b.iter(|| {
            promised.on_completed();
            promise.wait();
            promised.release();
        });
    });

    group.finish();
}

fn contended_cycles(iters: u64) -> Duration {
    let pool = Arc::new(Pool::<u64>::new(POOL_CAPACITY));
    let barrier = Arc::new(Barrier::new(CONTENDING_THREADS + 1));

    let threads = (0..CONTENDING_THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                for iteration in 0..iters {
                    let value = pool.get_or_else(|| iteration);
                    pool.donate(black_box(value));
                }
            })
        })
        .collect::<Vec<_>>();

    let start = Instant::now();
    barrier.wait();

    for handle in threads {
        handle.join().unwrap();
    }

    start.elapsed()
}
