use criterion::{black_box, criterion_group, criterion_main, Criterion};

use vibe_core::worker_pool::WorkerPool;

fn bench_map_unordered(c: &mut Criterion) {
    let pool: WorkerPool<f64> = WorkerPool::new(4, 64);
    let jobs: Vec<u64> = (0..16).collect();

    c.bench_function("worker_pool_map_unordered_16_jobs", |b| {
        b.iter(|| {
            let result = pool.map_unordered(black_box(jobs.clone()), |n| (0..n).map(|i| (i as f64).sqrt()).sum());
            black_box(result)
        })
    });
}

criterion_group!(benches, bench_map_unordered);
criterion_main!(benches);
