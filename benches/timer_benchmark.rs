use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::{Duration, Instant};

use evhttpd::timer::TimerQueue;

fn timer_push_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_push");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let now = Instant::now();
            b.iter(|| {
                let mut queue = TimerQueue::new();
                for i in 0..size {
                    // 截止时间交错，避免总是追加到末尾
                    let delay = Duration::from_millis(((i * 7919) % 1000) as u64);
                    queue.push(black_box(now + delay), Box::new(|| {}));
                }
                black_box(queue.len())
            });
        });
    }

    group.finish();
}

fn timer_fire_due_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_fire_due");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let now = Instant::now();
            b.iter(|| {
                let mut queue = TimerQueue::new();
                for i in 0..size {
                    queue.push(now + Duration::from_millis(i as u64), Box::new(|| {}));
                }
                // 一半到期
                let due = queue.fire_due(black_box(now + Duration::from_millis(size as u64 / 2)));
                for callback in due {
                    callback();
                }
                black_box(queue.earliest())
            });
        });
    }

    group.finish();
}

fn timer_cancel_benchmark(c: &mut Criterion) {
    c.bench_function("timer_cancel_half", |b| {
        let now = Instant::now();
        b.iter(|| {
            let mut queue = TimerQueue::new();
            let ids: Vec<_> = (0..500u64)
                .map(|i| queue.push(now + Duration::from_millis(i), Box::new(|| {})))
                .collect();
            for id in ids.into_iter().step_by(2) {
                queue.cancel(black_box(id));
            }
            black_box(queue.len())
        });
    });
}

criterion_group!(
    benches,
    timer_push_benchmark,
    timer_fire_due_benchmark,
    timer_cancel_benchmark
);
criterion_main!(benches);
