//! Effect interpreter benchmarks using criterion.
//!
//! Benchmarks deep flat_map chains, fork/join throughput and race latency
//! on a virtual clock.
//!
//! Run with: cargo bench --bench effects_bench

use std::time::Duration;

use brass_runtime::{race, ClockMode, Effect, Runtime, RuntimeConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

type Eff<A> = Effect<(), String, A>;

fn runtime() -> Runtime<()> {
    let config = RuntimeConfig::builder()
        .clock(ClockMode::Virtual)
        .build()
        .expect("valid config");
    Runtime::builder(()).config(config).build()
}

fn chain(depth: u64) -> Eff<u64> {
    (0..depth).fold(Eff::succeed(0), |acc, _| acc.flat_map(|n| Eff::succeed(n + 1)))
}

fn count_down(n: u64) -> Eff<u64> {
    if n == 0 {
        Eff::succeed(0)
    } else {
        Eff::succeed(n).flat_map(move |n| count_down(n - 1))
    }
}

/// Benchmark left-nested and right-nested flat_map chains
fn bench_flat_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_map");
    let rt = runtime();

    for depth in [1_000u64, 10_000, 100_000] {
        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(BenchmarkId::new("left_nested", depth), &depth, |b, &depth| {
            b.iter(|| black_box(rt.block_on(chain(depth))))
        });
        group.bench_with_input(BenchmarkId::new("right_nested", depth), &depth, |b, &depth| {
            b.iter(|| black_box(rt.block_on(count_down(depth))))
        });
    }

    group.finish();
}

/// Benchmark forking and joining many small fibers
fn bench_fork_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("fork_join");
    let rt = runtime();

    for fibers in [10u64, 100, 1_000] {
        group.throughput(Throughput::Elements(fibers));
        group.bench_with_input(BenchmarkId::from_parameter(fibers), &fibers, |b, &fibers| {
            b.iter(|| {
                let handles: Vec<_> = (0..fibers).map(|i| rt.fork(Eff::succeed(i))).collect();
                let joins = handles
                    .into_iter()
                    .fold(Eff::succeed(0u64), |acc, h| acc.zip(h.join_effect()).map(|(a, b)| a + b));
                black_box(rt.block_on(joins))
            })
        });
    }

    group.finish();
}

/// Benchmark a race between two timers, including loser cleanup
fn bench_race(c: &mut Criterion) {
    let mut group = c.benchmark_group("race");
    let rt = runtime();
    let scope = rt.scope();

    group.bench_function("sleep_vs_sleep", |b| {
        b.iter(|| {
            let slow = rt.delay(Duration::from_millis(10), Eff::succeed(1));
            let fast = rt.delay(Duration::from_millis(1), Eff::succeed(2));
            black_box(rt.block_on(race(slow, fast, &scope)))
        })
    });

    group.bench_function("ready_vs_never", |b| {
        b.iter(|| black_box(rt.block_on(race(Eff::succeed(1), rt.never(), &scope))))
    });

    group.finish();
}

criterion_group!(benches, bench_flat_map, bench_fork_join, bench_race);
criterion_main!(benches);
