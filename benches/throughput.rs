use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use weft::{AtomicCounter, EmptyQueueBehavior, Task, TaskScheduler};

/// Submit-and-wait over a burst of trivial tasks, scheduler startup
/// included.
fn task_burst(c: &mut Criterion) {
    c.bench_function("burst_10k_tasks", |b| {
        b.iter(|| {
            let scheduler = TaskScheduler::new();
            let hits = Arc::new(AtomicU64::new(0));

            let hits_clone = Arc::clone(&hits);
            scheduler
                .run(128, 4, EmptyQueueBehavior::Spin, move |ts| {
                    let counter = AtomicCounter::new(ts);
                    let tasks = (0..10_000)
                        .map(|_| {
                            let hits = Arc::clone(&hits_clone);
                            Task::new(move |_| {
                                hits.fetch_add(1, Ordering::Relaxed);
                            })
                        })
                        .collect();
                    ts.add_tasks(tasks, Some(&counter));
                    ts.wait_for_counter(&counter, 0);
                })
                .unwrap();

            assert_eq!(hits.load(Ordering::Relaxed), 10_000);
        });
    });
}

/// Partitioned summation, the classic triangle-number workload.
fn partitioned_sum(c: &mut Criterion) {
    const N: u64 = 1_000_000;
    const CHUNK: u64 = 10_000;

    c.bench_function("partitioned_sum_1m", |b| {
        b.iter(|| {
            let scheduler = TaskScheduler::new();
            let total = Arc::new(AtomicU64::new(0));

            let total_clone = Arc::clone(&total);
            scheduler
                .run(128, 4, EmptyQueueBehavior::Spin, move |ts| {
                    let counter = AtomicCounter::new(ts);
                    let tasks = (0..N / CHUNK)
                        .map(|chunk| {
                            let total = Arc::clone(&total_clone);
                            Task::new(move |_| {
                                let start = chunk * CHUNK + 1;
                                let end = (chunk + 1) * CHUNK;
                                let subtotal: u64 = (start..=end).sum();
                                total.fetch_add(subtotal, Ordering::Relaxed);
                            })
                        })
                        .collect();
                    ts.add_tasks(tasks, Some(&counter));
                    ts.wait_for_counter(&counter, 0);
                })
                .unwrap();

            assert_eq!(total.load(Ordering::Relaxed), N * (N + 1) / 2);
        });
    });
}

criterion_group!(benches, task_burst, partitioned_sum);
criterion_main!(benches);
