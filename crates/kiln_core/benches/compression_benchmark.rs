//! Benchmark for packet batch compression.
//!
//! Run with: cargo bench --package kiln_core --bench compression_benchmark

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kiln_core::{
    CompressBatchPromise, CompressBatchTask, CompressionThreshold, Compressor, DeflateCompressor,
    Lz4Compressor, PoolConfig, WorkerPool, DEFAULT_MAX_DECOMPRESSION_SIZE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Roughly what a chunk-heavy batch looks like: long runs plus some noise.
fn realistic_batch(size: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..size)
        .map(|i| if i % 64 < 48 { (i / 64) as u8 } else { rng.gen() })
        .collect()
}

fn codecs() -> Vec<(&'static str, Arc<dyn Compressor>)> {
    vec![
        (
            "deflate_6",
            Arc::new(DeflateCompressor::new(
                6,
                CompressionThreshold::at(256),
                DEFAULT_MAX_DECOMPRESSION_SIZE,
            )),
        ),
        (
            "deflate_1",
            Arc::new(DeflateCompressor::new(
                1,
                CompressionThreshold::at(256),
                DEFAULT_MAX_DECOMPRESSION_SIZE,
            )),
        ),
        (
            "lz4",
            Arc::new(Lz4Compressor::new(
                CompressionThreshold::at(256),
                DEFAULT_MAX_DECOMPRESSION_SIZE,
            )),
        ),
    ]
}

fn benchmark_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress");
    for size in [256usize, 4 * 1024, 64 * 1024] {
        let batch = realistic_batch(size);
        group.throughput(Throughput::Bytes(size as u64));
        for (name, codec) in codecs() {
            group.bench_with_input(BenchmarkId::new(name, size), &batch, |b, batch| {
                b.iter(|| black_box(codec.compress(black_box(batch))));
            });
        }
    }
    group.finish();
}

fn benchmark_decompress(c: &mut Criterion) {
    let mut group = c.benchmark_group("decompress");
    let batch = realistic_batch(64 * 1024);
    group.throughput(Throughput::Bytes(batch.len() as u64));
    for (name, codec) in codecs() {
        let Ok(payload) = codec.compress(&batch) else {
            continue;
        };
        group.bench_function(name, |b| {
            b.iter(|| black_box(codec.decompress(black_box(&payload))));
        });
    }
    group.finish();
}

/// Round trip through the pool: submit, then poll `collect_tasks` the way the
/// tick loop does until the promise settles.
fn benchmark_pool_round_trip(c: &mut Criterion) {
    let Ok(mut pool) = WorkerPool::new(PoolConfig::with_size(2)) else {
        return;
    };
    let compressor: Arc<dyn Compressor> = Arc::new(DeflateCompressor::new(
        6,
        CompressionThreshold::at(256),
        DEFAULT_MAX_DECOMPRESSION_SIZE,
    ));
    let batch = realistic_batch(16 * 1024);

    c.bench_function("pool_round_trip_16k", |b| {
        b.iter(|| {
            let promise = CompressBatchPromise::new();
            let task = CompressBatchTask::new(batch.clone(), promise.clone(), Arc::clone(&compressor));
            if pool.submit_task(Box::new(task)).is_err() {
                return;
            }
            let deadline = Instant::now() + Duration::from_secs(1);
            while !promise.is_settled() && Instant::now() < deadline {
                pool.collect_tasks();
            }
            black_box(promise.is_resolved());
        });
    });
}

criterion_group!(
    benches,
    benchmark_compress,
    benchmark_decompress,
    benchmark_pool_round_trip
);
criterion_main!(benches);
