use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_server::{task::TaskQueue, TaskRunner};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

fn bench_push_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_runner_latency");

    for pool_size in [1, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(pool_size),
            &pool_size,
            |b, &size| {
                let runner = TaskRunner::new(size);
                runner.start(size, false).unwrap();

                b.iter(|| {
                    let done = Arc::new(AtomicBool::new(false));
                    let d = done.clone();
                    let start = Instant::now();

                    runner
                        .push(move || d.store(true, Ordering::Release))
                        .unwrap();

                    while !done.load(Ordering::Acquire) {
                        thread::yield_now();
                    }

                    black_box(start.elapsed());
                });

                runner.stop(true);
            },
        );
    }
    group.finish();
}

fn bench_burst_throughput(c: &mut Criterion) {
    const BURST: usize = 10_000;

    let mut group = c.benchmark_group("task_runner_burst");
    group.throughput(Throughput::Elements(BURST as u64));
    group.measurement_time(Duration::from_secs(10));

    for pool_size in [2, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(pool_size),
            &pool_size,
            |b, &size| {
                let runner = TaskRunner::new(size);
                runner.start(size, false).unwrap();

                b.iter(|| {
                    let counter = Arc::new(AtomicUsize::new(0));
                    for _ in 0..BURST {
                        let counter = counter.clone();
                        runner
                            .push(move || {
                                counter.fetch_add(1, Ordering::Relaxed);
                            })
                            .unwrap();
                    }
                    while counter.load(Ordering::Relaxed) < BURST {
                        thread::yield_now();
                    }
                });

                runner.stop(true);
            },
        );
    }
    group.finish();
}

fn bench_queue_push_pop(c: &mut Criterion) {
    c.bench_function("task_queue_push_pop", |b| {
        let queue = TaskQueue::new();
        b.iter(|| {
            queue.push(Box::new(|| {}));
            black_box(queue.pop());
        });
    });
}

criterion_group!(
    benches,
    bench_push_latency,
    bench_burst_throughput,
    bench_queue_push_pop
);
criterion_main!(benches);
