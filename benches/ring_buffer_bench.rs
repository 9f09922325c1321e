use criterion::{black_box, criterion_group, criterion_main, Criterion};

use vibe_core::codec::ClientId;
use vibe_core::ring_buffer::RingStore;

fn cid() -> ClientId {
    ClientId([0, 0, 0, 0, 0, 1])
}

fn bench_ingest(c: &mut Criterion) {
    let store = RingStore::new(800, 4.0);
    let samples: Vec<(f32, f32, f32)> = (0..256).map(|i| (i as f32 * 0.001, 0.0, 0.0)).collect();
    let mut t0 = 0u64;

    c.bench_function("ring_buffer_ingest_256_samples", |b| {
        b.iter(|| {
            t0 += 1000;
            store.ingest(black_box(cid()), black_box(&samples), t0);
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let store = RingStore::new(800, 4.0);
    let samples: Vec<(f32, f32, f32)> = (0..3200).map(|i| (i as f32 * 0.001, 0.0, 0.0)).collect();
    store.ingest(cid(), &samples, 1_000_000);

    c.bench_function("ring_buffer_snapshot_2048", |b| {
        b.iter(|| black_box(store.snapshot(black_box(cid()), 2048)))
    });
}

criterion_group!(benches, bench_ingest, bench_snapshot);
criterion_main!(benches);
