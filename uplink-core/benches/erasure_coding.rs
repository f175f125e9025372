//! Benchmarks for the Reed-Solomon redundancy strategy
//!
//! Run with: cargo bench --package uplink-core --bench erasure_coding

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use uplink_core::erasure::{RedundancyScheme, RedundancyStrategy, Share};

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn production() -> RedundancyStrategy {
    RedundancyStrategy::new(RedundancyScheme::new(29, 35, 80, 95, 1024).unwrap()).unwrap()
}

fn dev() -> RedundancyStrategy {
    RedundancyStrategy::new(RedundancyScheme::new(4, 6, 8, 10, 1024).unwrap()).unwrap()
}

/// Benchmark encoding one segment at various sizes
fn bench_encode(c: &mut Criterion) {
    let strategies = [("29-95", production()), ("4-10", dev())];

    let mut group = c.benchmark_group("segment_encode");

    for size in [
        64 * 1024,             // 64 KB
        1024 * 1024,           // 1 MB
        8 * 1024 * 1024,       // 8 MB
    ] {
        let data = generate_data(size);
        group.throughput(Throughput::Bytes(size as u64));

        for (label, strategy) in &strategies {
            group.bench_with_input(
                BenchmarkId::new(*label, format!("{}KB", size / 1024)),
                &data,
                |b, data| b.iter(|| strategy.encode(black_box(data))),
            );
        }
    }

    group.finish();
}

/// Benchmark decoding from data shares only vs. parity-heavy subsets
fn bench_decode(c: &mut Criterion) {
    let strategy = production();
    let data = generate_data(8 * 1024 * 1024); // 8 MB
    let original_size = data.len();
    let shares = strategy.encode(&data).unwrap();

    let mut group = c.benchmark_group("segment_decode_8MB");
    group.throughput(Throughput::Bytes(original_size as u64));

    // First k shares: no reconstruction needed
    {
        let subset: Vec<Share> = shares[..29].to_vec();
        group.bench_function("data_only", |b| {
            b.iter(|| strategy.decode(black_box(&subset), original_size))
        });
    }

    // Last k shares: mostly parity
    {
        let subset: Vec<Share> = shares[95 - 29..].to_vec();
        group.bench_function("parity_heavy", |b| {
            b.iter(|| strategy.decode(black_box(&subset), original_size))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
