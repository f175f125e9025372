//! Benchmarks for cryptographic operations
//!
//! Run with: cargo bench --package uplink-core --bench crypto

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use uplink_core::crypto::{
    derive_segment_key, BlockCipher, CipherKind, ContentHash, EncryptionScheme, Key,
};
use uplink_core::encryption::{encrypt_segment, Decryptor};

const BLOCK_SIZE: usize = 1024;

/// Generate test data of specified size
fn generate_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Benchmark Blake3 hashing at piece sizes
fn bench_blake3_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("blake3_hash");

    for size in [
        1024,                  // 1 KB
        64 * 1024,             // 64 KB
        1024 * 1024,           // 1 MB
        10 * 1024 * 1024,      // 10 MB
    ] {
        let data = generate_data(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("sequential", format_size(size)),
            &data,
            |b, data| b.iter(|| ContentHash::compute(black_box(data))),
        );
        group.bench_with_input(
            BenchmarkId::new("parallel", format_size(size)),
            &data,
            |b, data| b.iter(|| ContentHash::compute_parallel(black_box(data))),
        );
    }

    group.finish();
}

/// Benchmark block-wise segment encryption for both ciphers
fn bench_segment_encrypt(c: &mut Criterion) {
    let key = Key::generate();

    let mut group = c.benchmark_group("segment_encrypt");

    for size in [
        4 * 1024,              // 4 KB (inline limit)
        1024 * 1024,           // 1 MB
        8 * 1024 * 1024,       // 8 MB
    ] {
        let data = generate_data(size);
        group.throughput(Throughput::Bytes(size as u64));

        for kind in [CipherKind::AesGcm, CipherKind::SecretBox] {
            group.bench_with_input(
                BenchmarkId::new(kind.to_string(), format_size(size)),
                &data,
                |b, data| {
                    b.iter(|| {
                        let cipher = BlockCipher::new(kind, key.as_bytes()).unwrap();
                        encrypt_segment(cipher, BLOCK_SIZE, black_box(data))
                    })
                },
            );
        }
    }

    group.finish();
}

/// Benchmark whole-segment vs. single-block decryption
fn bench_segment_decrypt(c: &mut Criterion) {
    let key = Key::generate();
    let scheme = EncryptionScheme::new(CipherKind::AesGcm, BLOCK_SIZE).unwrap();
    let data = generate_data(8 * 1024 * 1024); // 8 MB
    let ciphertext: Bytes = encrypt_segment(
        BlockCipher::new(CipherKind::AesGcm, key.as_bytes()).unwrap(),
        BLOCK_SIZE,
        &data,
    )
    .unwrap();

    let mut group = c.benchmark_group("segment_decrypt_8MB");

    group.bench_function("full", |b| {
        b.iter(|| {
            let cipher = BlockCipher::new(CipherKind::AesGcm, key.as_bytes()).unwrap();
            Decryptor::new(cipher, scheme, ciphertext.clone(), data.len() as u64)
                .unwrap()
                .decrypt_all()
        })
    });

    group.bench_function("one_block_range", |b| {
        b.iter(|| {
            let cipher = BlockCipher::new(CipherKind::AesGcm, key.as_bytes()).unwrap();
            Decryptor::new(cipher, scheme, ciphertext.clone(), data.len() as u64)
                .unwrap()
                .decrypt_range(black_box(4096..4106))
        })
    });

    group.finish();
}

/// Benchmark per-segment key derivation
fn bench_key_derivation(c: &mut Criterion) {
    let root = Key::generate();
    c.bench_function("derive_segment_key", |b| {
        b.iter(|| derive_segment_key(&root, black_box("bucket/some/object/key"), 17))
    });
}

/// Format size for display
fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{}MB", bytes / (1024 * 1024))
    } else if bytes >= 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{}B", bytes)
    }
}

criterion_group!(
    benches,
    bench_blake3_hash,
    bench_segment_encrypt,
    bench_segment_decrypt,
    bench_key_derivation,
);
criterion_main!(benches);
