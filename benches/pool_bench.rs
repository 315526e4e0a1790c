use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::prelude::*;
use taskpool::{Config, Context, Task, TaskError, TaskThread, DEFAULT_POOL};

struct Noop;

impl Task for Noop {
    fn run(&self, _thread: &dyn TaskThread) -> Result<bool, TaskError> {
        Ok(true)
    }
}

struct Bump {
    counter: Arc<AtomicUsize>,
}

impl Task for Bump {
    fn run(&self, _thread: &dyn TaskThread) -> Result<bool, TaskError> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

struct Barriers {
    rounds: usize,
}

impl Task for Barriers {
    fn max_workers(&self) -> usize {
        4
    }

    fn run(&self, thread: &dyn TaskThread) -> Result<bool, TaskError> {
        for _ in 0..self.rounds {
            thread.synchronize()?;
        }
        Ok(true)
    }
}

fn dispatch_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let ctx = Context::with_config(Config {
        pools: 1,
        workers_per_pool: 4,
        gpu: None,
        listener: None,
    });
    let task = Arc::new(Noop);
    group.bench_function("perform_noop", |b| {
        b.iter(|| {
            ctx.perform_task(task.clone(), DEFAULT_POOL).unwrap();
        })
    });

    let counter = Arc::new(AtomicUsize::new(0));
    group.bench_function("hundred_queued", |b| {
        b.iter(|| {
            for _ in 0..100 {
                ctx.submit_task(
                    Arc::new(Bump {
                        counter: counter.clone(),
                    }),
                    DEFAULT_POOL,
                )
                .unwrap();
            }
            ctx.wait(DEFAULT_POOL).unwrap();
        })
    });

    group.finish();
}

fn barrier_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier");

    let ctx = Context::with_config(Config {
        pools: 1,
        workers_per_pool: 4,
        gpu: None,
        listener: None,
    });
    let task = Arc::new(Barriers { rounds: 64 });
    group.bench_function("sixty_four_rounds", |b| {
        b.iter(|| {
            ctx.perform_task(task.clone(), DEFAULT_POOL).unwrap();
        })
    });

    group.finish();
}

fn spread_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("spread");

    let ctx = Context::with_config(Config {
        pools: 2,
        workers_per_pool: 2,
        gpu: None,
        listener: None,
    });
    let counter = Arc::new(AtomicUsize::new(0));
    group.bench_function("two_pools", |b| {
        b.iter(|| {
            let mut rng = thread_rng();
            for _ in 0..100 {
                let pool = rng.gen_range(0..2);
                ctx.submit_task(
                    Arc::new(Bump {
                        counter: counter.clone(),
                    }),
                    pool,
                )
                .unwrap();
            }
            ctx.wait(0).unwrap();
            ctx.wait(1).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, dispatch_bench, barrier_bench, spread_bench);
criterion_main!(benches);
