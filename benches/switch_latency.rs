//! Scheduler switch-latency benchmarks using criterion.
//!
//! Measures the yield round-trip on a single scheduler and the full
//! spawn-to-join cost, including stack allocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

fn bench_yield_round_trip(c: &mut Criterion) {
    let _fb = spindle::init();

    // One background fiber so every yield performs a real switch.
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let pong = spindle::spawn("pong", move || {
        while !stop2.load(Ordering::Relaxed) {
            spindle::yield_now();
        }
    });

    c.bench_function("yield_round_trip", |b| {
        b.iter(|| {
            spindle::yield_now();
        })
    });

    stop.store(true, Ordering::Relaxed);
    pong.join().unwrap();
}

fn bench_spawn_join(c: &mut Criterion) {
    let _fb = spindle::init();
    c.bench_function("spawn_join", |b| {
        b.iter(|| {
            let h = spindle::spawn("unit", || {
                std::hint::black_box(42);
            });
            h.join().unwrap();
        })
    });
}

fn bench_park_unpark(c: &mut Criterion) {
    let _fb = spindle::init();
    c.bench_function("park_unpark_pair", |b| {
        b.iter(|| {
            let token_obj = Box::new(0u8);
            let token = spindle::token_for(&*token_obj);
            let waiter = spindle::spawn("waiter", move || {
                spindle::suspend_conditionally(token, || false);
            });
            spindle::yield_now();
            spindle::notify_one(token);
            waiter.join().unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_yield_round_trip,
    bench_spawn_join,
    bench_park_unpark
);
criterion_main!(benches);
