use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relaynet::future::{Context, Deferred};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn benchmark_chains(c: &mut Criterion) {
    let mut group = c.benchmark_group("deferred_chain");
    for depth in [10u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("map_pending", depth), &depth, |b, &depth| {
            let ctx = Context::serial();
            b.iter(|| {
                let head = Deferred::<u64>::new(&ctx);
                let mut tail = head.clone();
                for _ in 0..depth {
                    tail = tail.map(|v| v + 1);
                }
                head.complete(0);
                black_box(tail.outcome())
            })
        });

        group.bench_with_input(BenchmarkId::new("compose", depth), &depth, |b, &depth| {
            let ctx = Context::serial();
            b.iter(|| {
                let head = Deferred::<u64>::new(&ctx);
                let mut tail = head.clone();
                for _ in 0..depth {
                    let inner = ctx.clone();
                    let failed = ctx.clone();
                    tail = tail.compose(
                        move |v| Deferred::succeeded(&inner, v + 1),
                        move |e| Deferred::failed(&failed, e),
                    );
                }
                head.complete(0);
                black_box(tail.outcome())
            })
        });
    }
    group.finish();
}

fn benchmark_listeners(c: &mut Criterion) {
    let ctx = Context::serial();

    c.bench_function("deferred_fan_out_100", |b| {
        b.iter(|| {
            let total = Arc::new(AtomicU64::new(0));
            let deferred = Deferred::<u64>::new(&ctx);
            for _ in 0..100 {
                let total = total.clone();
                deferred.on_success(move |v| {
                    total.fetch_add(v, Ordering::Relaxed);
                });
            }
            deferred.complete(1);
            black_box(total.load(Ordering::Relaxed))
        })
    });

    let settled = Deferred::succeeded(&ctx, 7u64);
    c.bench_function("deferred_settled_map", |b| {
        b.iter(|| black_box(settled.map(|v| v * 2).outcome()))
    });
}

criterion_group!(benches, benchmark_chains, benchmark_listeners);
criterion_main!(benches);
