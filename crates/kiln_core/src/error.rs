//! # Core Error Types
//!
//! All errors that can occur between the tick thread and the worker pool.

use thiserror::Error;

/// A compressor failed to produce output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    /// The underlying codec reported a failure.
    #[error("compression failed: {0}")]
    Codec(String),
}

/// Compressed input could not be turned back into a buffer.
///
/// Callers treat this as corrupt input from the remote end. It is handled at
/// the session boundary and never allowed to take down the tick thread.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The decoded output would exceed the configured maximum.
    #[error("decompressed size {size} exceeds limit of {limit} bytes")]
    TooLarge {
        /// Size seen (or announced) when the limit tripped.
        size: usize,
        /// The configured limit.
        limit: usize,
    },

    /// The payload is not valid for this codec.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A worker task did not complete successfully.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The compressor returned an error.
    #[error(transparent)]
    Compress(#[from] CompressError),

    /// The task reported a failure of its own.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task panicked on the worker thread.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Misuse of a [`CompressBatchPromise`](crate::CompressBatchPromise).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromiseError {
    /// `resolve` or `reject` was called on a promise that already settled.
    #[error("promise has already been settled")]
    AlreadySettled,

    /// The result was read before the promise settled.
    #[error("promise is still pending")]
    Pending,

    /// The promise settled with a task failure.
    #[error("promise was rejected: {0}")]
    Rejected(TaskError),
}

/// Errors raised by the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been shut down and accepts no more tasks.
    #[error("worker pool is shut down")]
    ShutDown,

    /// A pool size of zero, or a shrink request, was given.
    #[error("invalid worker pool size: {0}")]
    InvalidSize(usize),

    /// A worker slot index outside the pool was given.
    #[error("worker slot {slot} out of range (pool size {size})")]
    InvalidSlot {
        /// Requested slot.
        slot: usize,
        /// Current pool size.
        size: usize,
    },

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Result type for worker pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
