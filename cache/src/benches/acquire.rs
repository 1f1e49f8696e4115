use super::init;
use criterion::{criterion_group, Criterion};
use span_cache::{storage::Blob as _, Acquired};
use std::time::{Duration, Instant};

fn bench_acquire(c: &mut Criterion) {
    for &spans in &[100u64, 1_000, 10_000] {
        // Populate the cache with one-byte spans
        let cache = init();
        for offset in 0..spans {
            let Acquired::Hole(mut hole) = cache.acquire("key", offset * 2) else {
                panic!("expected hole");
            };
            let (name, blob) = cache.start_file(&hole, 1).unwrap();
            blob.write_at(&[offset as u8], 0).unwrap();
            cache.commit(&mut hole, name, 1).unwrap();
            cache.release(hole);
        }

        // Alternate between hits and misses
        c.bench_function(&format!("{}/spans={}", module_path!(), spans), |b| {
            b.iter_custom(|iters| {
                let mut total = Duration::ZERO;
                for i in 0..iters {
                    let offset = i % (spans * 2);
                    let start = Instant::now();
                    let acquired = cache.acquire("key", offset);
                    total += start.elapsed();
                    if let Acquired::Hole(hole) = acquired {
                        cache.release(hole);
                    }
                }
                total
            });
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_acquire
}
