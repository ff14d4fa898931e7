use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relaynet::CyclicSequence;
use std::sync::Arc;
use std::thread;

fn benchmark_cursor(c: &mut Criterion) {
    let seq: CyclicSequence<u32> = (0..16).collect();

    c.bench_function("cyclic_next", |b| b.iter(|| black_box(seq.next())));

    c.bench_function("cyclic_snapshot_iter", |b| {
        b.iter(|| black_box(seq.iter_from(true).sum::<u32>()))
    });

    // Four threads contending on one cursor.
    let shared = Arc::new(seq.clone());
    c.bench_function("cyclic_next_contended_4x1000", |b| {
        b.iter(|| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let shared = shared.clone();
                    thread::spawn(move || {
                        for _ in 0..1000 {
                            black_box(shared.next());
                        }
                    })
                })
                .collect();
            for worker in workers {
                let _ = worker.join();
            }
        })
    });
}

fn benchmark_copy_on_write(c: &mut Criterion) {
    let seq: CyclicSequence<u32> = (0..64).collect();

    c.bench_function("cyclic_add", |b| b.iter(|| black_box(seq.add(64))));
    c.bench_function("cyclic_remove_present", |b| b.iter(|| black_box(seq.remove(&32))));
    c.bench_function("cyclic_remove_absent", |b| b.iter(|| black_box(seq.remove(&999))));
}

criterion_group!(benches, benchmark_cursor, benchmark_copy_on_write);
criterion_main!(benches);
