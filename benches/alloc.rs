//! Allocation throughput benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dmapool::{DmaBufferPool, PoolConfig};

fn bench_pool() -> DmaBufferPool {
    DmaBufferPool::new(PoolConfig {
        segment_size: 1 << 28,
        max_segments: 4,
        persistent_segments: Some(1),
        install_fault_handler: false,
        ..PoolConfig::default()
    })
    .expect("pool creation")
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    let pool = bench_pool();
    let owner = pool.owner();

    for size in [64usize, 4096, 64 * 1024, 1 << 20] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let ptr = pool.alloc(&owner, size).expect("alloc");
                pool.free(ptr).expect("free");
            });
        });
    }

    group.finish();
}

fn bench_churn_mixed_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");
    let pool = bench_pool();
    let owner = pool.owner();
    let sizes = [100usize, 512, 4096, 100_000];

    group.throughput(Throughput::Elements(64));
    group.bench_function("64_live_mixed", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..64)
                .map(|i| pool.alloc(&owner, sizes[i % sizes.len()]).expect("alloc"))
                .collect();
            for ptr in ptrs {
                pool.free(ptr).expect("free");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_churn_mixed_sizes);
criterion_main!(benches);
