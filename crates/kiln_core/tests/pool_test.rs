//! Integration tests for the worker pool and the compress-batch handoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kiln_core::{
    AsyncTask, CompressBatchPromise, CompressBatchTask, CompressError, CompressionThreshold,
    Compressor, DecodeError, DeflateCompressor, PoolConfig, PromiseError, TaskError, WorkerContext,
    WorkerPool,
};

const MIB: usize = 1024 * 1024;

/// Parks `bytes` of accounted memory in the worker store.
struct BloatTask {
    bytes: usize,
    done: Arc<AtomicUsize>,
}

impl AsyncTask for BloatTask {
    fn on_run(&mut self, ctx: &mut WorkerContext) -> Result<(), TaskError> {
        ctx.save_to_store("bloat", vec![0u8; 16], self.bytes);
        Ok(())
    }

    fn on_completion(self: Box<Self>, _outcome: Result<(), TaskError>) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

struct SleepTask {
    duration: Duration,
}

impl AsyncTask for SleepTask {
    fn on_run(&mut self, _ctx: &mut WorkerContext) -> Result<(), TaskError> {
        std::thread::sleep(self.duration);
        Ok(())
    }

    fn on_completion(self: Box<Self>, _outcome: Result<(), TaskError>) {}
}

struct PanickingCompressor;

impl Compressor for PanickingCompressor {
    fn will_compress(&self, _buffer: &[u8]) -> bool {
        true
    }

    fn compress(&self, _buffer: &[u8]) -> Result<Vec<u8>, CompressError> {
        panic!("codec bug");
    }

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(payload.to_vec())
    }
}

fn wait_for(pool: &mut WorkerPool, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() && Instant::now() < deadline {
        pool.collect_tasks();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(done(), "timed out waiting for the pool");
}

fn bloat(bytes: usize, done: &Arc<AtomicUsize>) -> Box<BloatTask> {
    Box::new(BloatTask {
        bytes,
        done: Arc::clone(done),
    })
}

#[test]
fn test_compress_batch_round_trip_through_pool() {
    let mut pool = WorkerPool::new(PoolConfig::with_size(2)).unwrap();
    let compressor: Arc<dyn Compressor> =
        Arc::new(DeflateCompressor::new(6, CompressionThreshold::at(256), 4 * MIB));

    let batches: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 1024 * (usize::from(i) + 1)]).collect();
    let promises: Vec<CompressBatchPromise> = batches
        .iter()
        .map(|batch| {
            let promise = CompressBatchPromise::new();
            let task = CompressBatchTask::new(batch.clone(), promise.clone(), Arc::clone(&compressor));
            pool.submit_task(Box::new(task)).unwrap();
            promise
        })
        .collect();

    wait_for(&mut pool, || promises.iter().all(CompressBatchPromise::is_settled));

    for (batch, promise) in batches.iter().zip(&promises) {
        let compressed = promise.result().unwrap();
        assert_eq!(&compressor.decompress(&compressed).unwrap(), batch);
    }
}

#[test]
fn test_worker_over_limit_is_recycled_before_next_task() {
    let mut pool = WorkerPool::new(PoolConfig {
        size: 1,
        worker_memory_limit: Some(MIB),
    })
    .unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    pool.submit_task(bloat(2 * MIB, &done)).unwrap();
    wait_for(&mut pool, || done.load(Ordering::SeqCst) == 1);
    assert_eq!(pool.worker_memory_usage(0), Some(2 * MIB));
    assert_eq!(pool.stats().recycled, 0);

    pool.submit_task(bloat(0, &done)).unwrap();
    assert_eq!(pool.stats().recycled, 1);
    // Replacement worker starts with a clean store.
    wait_for(&mut pool, || done.load(Ordering::SeqCst) == 2);
    assert_eq!(pool.worker_memory_usage(0), Some(0));
}

#[test]
fn test_compress_scratch_counts_toward_worker_limit() {
    let mut pool = WorkerPool::new(PoolConfig {
        size: 1,
        worker_memory_limit: Some(64 * 1024),
    })
    .unwrap();
    let compressor: Arc<dyn Compressor> =
        Arc::new(DeflateCompressor::new(6, CompressionThreshold::at(256), 4 * MIB));

    let mut rng = StdRng::seed_from_u64(0x6b69);
    let mut noise = vec![0u8; 256 * 1024];
    rng.fill(&mut noise[..]);

    let first = CompressBatchPromise::new();
    let task = CompressBatchTask::new(noise.clone(), first.clone(), Arc::clone(&compressor));
    pool.submit_task(Box::new(task)).unwrap();
    wait_for(&mut pool, || first.is_settled());

    // Incompressible input leaves a scratch buffer at least as large as the batch.
    let usage = pool.worker_memory_usage(0).unwrap();
    assert!(usage >= noise.len(), "scratch usage {usage} below batch size");
    assert_eq!(pool.stats().recycled, 0);

    let second = CompressBatchPromise::new();
    let task = CompressBatchTask::new(vec![1u8; 512], second.clone(), Arc::clone(&compressor));
    pool.submit_task(Box::new(task)).unwrap();
    assert_eq!(pool.stats().recycled, 1);

    wait_for(&mut pool, || second.is_settled());
    assert!(pool.worker_memory_usage(0).unwrap() < 64 * 1024);
    assert_eq!(compressor.decompress(&first.result().unwrap()).unwrap(), noise);
    assert_eq!(compressor.decompress(&second.result().unwrap()).unwrap(), vec![1u8; 512]);
}

#[test]
fn test_worker_at_limit_is_kept() {
    let mut pool = WorkerPool::new(PoolConfig {
        size: 1,
        worker_memory_limit: Some(MIB),
    })
    .unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    pool.submit_task(bloat(MIB, &done)).unwrap();
    wait_for(&mut pool, || done.load(Ordering::SeqCst) == 1);
    pool.submit_task(bloat(MIB, &done)).unwrap();

    assert_eq!(pool.stats().recycled, 0);
}

#[test]
fn test_unlimited_pool_never_recycles() {
    let mut pool = WorkerPool::new(PoolConfig::from_limit_mb(1, -1)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for round in 1..=5 {
        pool.submit_task(bloat(1024 * MIB, &done)).unwrap();
        wait_for(&mut pool, || done.load(Ordering::SeqCst) == round);
    }

    assert_eq!(pool.stats().recycled, 0);
    assert_eq!(pool.memory_usage(), 1024 * MIB);
}

#[test]
fn test_task_panic_rejects_promise() {
    let mut pool = WorkerPool::new(PoolConfig::with_size(1)).unwrap();
    let promise = CompressBatchPromise::new();
    let task = CompressBatchTask::new(vec![1; 512], promise.clone(), Arc::new(PanickingCompressor));

    pool.submit_task(Box::new(task)).unwrap();
    wait_for(&mut pool, || promise.is_settled());

    match promise.result() {
        Err(PromiseError::Rejected(TaskError::Panicked(message))) => {
            assert!(message.contains("codec bug"));
        }
        other => panic!("expected a panicked rejection, got {other:?}"),
    }
    assert_eq!(pool.stats().failed, 1);

    // The worker survives its task panicking.
    let done = Arc::new(AtomicUsize::new(0));
    pool.submit_task(bloat(0, &done)).unwrap();
    wait_for(&mut pool, || done.load(Ordering::SeqCst) == 1);
}

#[test]
fn test_shutdown_drains_queued_work() {
    let mut pool = WorkerPool::new(PoolConfig::with_size(2)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        pool.submit_task(bloat(0, &done)).unwrap();
    }

    let report = pool.shutdown(Duration::from_secs(5));

    assert!(report.is_clean());
    assert_eq!(report.stopped, 2);
    assert_eq!(done.load(Ordering::SeqCst), 10);
}

#[test]
fn test_shutdown_timeout_abandons_busy_worker() {
    let mut pool = WorkerPool::new(PoolConfig::with_size(1)).unwrap();
    pool.submit_task(Box::new(SleepTask {
        duration: Duration::from_millis(500),
    }))
    .unwrap();

    let start = Instant::now();
    let report = pool.shutdown(Duration::from_millis(50));

    assert_eq!(report.abandoned, 1);
    assert_eq!(report.stopped, 0);
    assert!(start.elapsed() < Duration::from_millis(400));
}
