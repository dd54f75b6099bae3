//! Units of work executed on pool workers.

use std::sync::Arc;

use super::worker::WorkerContext;
use crate::compression::Compressor;
use crate::error::{PromiseError, TaskError};
use crate::sync::CompressBatchPromise;

/// A task the worker pool can run.
///
/// The lifecycle is split across two threads:
///
/// ```text
/// worker thread:  on_run(&mut self, ctx)          (pure work, no shared game state)
/// tick thread:    on_completion(self, outcome)    (inside WorkerPool::collect_tasks)
/// ```
///
/// A panic inside `on_run` is caught by the worker and reported to
/// `on_completion` as [`TaskError::Panicked`].
pub trait AsyncTask: Send + 'static {
    /// Performs the work. Runs on a worker thread.
    fn on_run(&mut self, ctx: &mut WorkerContext) -> Result<(), TaskError>;

    /// Publishes the result. Runs on the thread calling `collect_tasks`.
    fn on_completion(self: Box<Self>, outcome: Result<(), TaskError>);

    /// Short name used in logs.
    fn name(&self) -> &'static str {
        "task"
    }
}

/// Compresses one packet batch and settles its promise.
pub struct CompressBatchTask {
    buffer: Vec<u8>,
    promise: CompressBatchPromise,
    compressor: Arc<dyn Compressor>,
    output: Option<Vec<u8>>,
}

impl CompressBatchTask {
    /// Wraps a batch buffer for worker compression.
    #[must_use]
    pub fn new(
        buffer: Vec<u8>,
        promise: CompressBatchPromise,
        compressor: Arc<dyn Compressor>,
    ) -> Self {
        Self {
            buffer,
            promise,
            compressor,
            output: None,
        }
    }

    /// Returns the promise this task will settle.
    #[must_use]
    pub fn promise(&self) -> &CompressBatchPromise {
        &self.promise
    }
}

impl AsyncTask for CompressBatchTask {
    fn on_run(&mut self, ctx: &mut WorkerContext) -> Result<(), TaskError> {
        // The scratch buffer stays on the worker and is accounted at its
        // capacity, so large batches count toward the worker's memory limit.
        let key = scratch_key(self.compressor.as_ref());
        let mut scratch: Vec<u8> = ctx.take_from_store(&key).unwrap_or_default();
        let result = self.compressor.compress_into(&self.buffer, &mut scratch);
        if result.is_ok() {
            self.output = Some(scratch.clone());
        }
        let capacity = scratch.capacity();
        ctx.save_to_store(key, scratch, capacity);

        result?;
        self.buffer = Vec::new();
        Ok(())
    }

    fn on_completion(self: Box<Self>, outcome: Result<(), TaskError>) {
        let settled = match (outcome, self.output) {
            (Ok(()), Some(bytes)) => self.promise.resolve(bytes),
            (Ok(()), None) => self
                .promise
                .reject(TaskError::Failed("compression produced no output".into())),
            (Err(error), _) => {
                tracing::debug!(%error, "Batch compression failed");
                self.promise.reject(error)
            }
        };

        if let Err(PromiseError::AlreadySettled) = settled {
            tracing::error!("Compress-batch promise was settled before its task completed");
        }
    }

    fn name(&self) -> &'static str {
        "compress-batch"
    }
}

/// Worker store key of the scratch buffer used by `compressor`.
#[must_use]
pub fn scratch_key(compressor: &dyn Compressor) -> String {
    format!("compress-scratch/{}", compressor.name())
}

impl std::fmt::Debug for CompressBatchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressBatchTask")
            .field("buffer_len", &self.buffer.len())
            .field("promise", &self.promise)
            .field("done", &self.output.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionThreshold, DeflateCompressor};
    use crate::error::CompressError;

    struct BrokenCompressor;

    impl Compressor for BrokenCompressor {
        fn will_compress(&self, _buffer: &[u8]) -> bool {
            true
        }

        fn compress(&self, _buffer: &[u8]) -> Result<Vec<u8>, CompressError> {
            Err(CompressError::Codec("out of coffee".into()))
        }

        fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, crate::DecodeError> {
            Ok(payload.to_vec())
        }
    }

    #[test]
    fn test_run_then_complete_resolves() {
        let compressor: Arc<dyn Compressor> =
            Arc::new(DeflateCompressor::new(6, CompressionThreshold::at(0), 1 << 20));
        let promise = CompressBatchPromise::new();
        let mut task = Box::new(CompressBatchTask::new(
            vec![1u8; 1000],
            promise.clone(),
            Arc::clone(&compressor),
        ));

        let mut ctx = WorkerContext::new(0);
        let outcome = task.on_run(&mut ctx);
        assert!(!promise.is_settled());

        task.on_completion(outcome);
        let bytes = promise.result().unwrap();
        assert_eq!(compressor.decompress(&bytes).unwrap(), vec![1u8; 1000]);
    }

    #[test]
    fn test_scratch_buffer_accounted_on_worker() {
        let compressor: Arc<dyn Compressor> =
            Arc::new(DeflateCompressor::new(6, CompressionThreshold::at(0), 1 << 20));
        let mut ctx = WorkerContext::new(0);

        let mut task = CompressBatchTask::new(
            vec![9u8; 64 * 1024],
            CompressBatchPromise::new(),
            Arc::clone(&compressor),
        );
        task.on_run(&mut ctx).unwrap();

        let key = scratch_key(compressor.as_ref());
        let capacity = ctx.fetch_from_store::<Vec<u8>>(&key).map(Vec::capacity).unwrap();
        assert!(capacity > 0);
        assert_eq!(ctx.memory_usage(), capacity);

        // A second batch reuses the same entry instead of adding one.
        let mut task =
            CompressBatchTask::new(vec![3u8; 1024], CompressBatchPromise::new(), compressor);
        task.on_run(&mut ctx).unwrap();
        assert!(ctx.memory_usage() >= capacity);
        assert_eq!(
            ctx.memory_usage(),
            ctx.fetch_from_store::<Vec<u8>>(&key).map(Vec::capacity).unwrap()
        );
    }

    #[test]
    fn test_compressor_error_rejects() {
        let promise = CompressBatchPromise::new();
        let mut task = Box::new(CompressBatchTask::new(
            vec![0; 16],
            promise.clone(),
            Arc::new(BrokenCompressor),
        ));

        let outcome = task.on_run(&mut WorkerContext::new(0));
        task.on_completion(outcome);

        assert!(matches!(
            promise.result(),
            Err(PromiseError::Rejected(TaskError::Compress(_)))
        ));
    }

    #[test]
    fn test_completion_without_run_rejects() {
        let promise = CompressBatchPromise::new();
        let task = Box::new(CompressBatchTask::new(
            vec![0; 16],
            promise.clone(),
            Arc::new(BrokenCompressor),
        ));

        task.on_completion(Ok(()));
        assert!(promise.is_rejected());
    }
}
