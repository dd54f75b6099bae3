//! # KILN Core
//!
//! The CPU-heavy half of the packet pipeline, kept away from the tick thread.
//!
//! ## Architecture Rules
//!
//! 1. **The tick thread never blocks on a worker** - results come back through
//!    [`CompressBatchPromise`] and are settled inside [`WorkerPool::collect_tasks`]
//! 2. **Workers touch no shared game state** - a task owns its input bytes and
//!    a shared, immutable [`Compressor`]
//! 3. **Decompression is bounded** - every codec refuses output above its
//!    configured limit
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kiln_core::{
//!     CompressBatchPromise, CompressBatchTask, CompressionThreshold, DeflateCompressor,
//!     PoolConfig, WorkerPool, DEFAULT_MAX_DECOMPRESSION_SIZE,
//! };
//!
//! let compressor = Arc::new(DeflateCompressor::new(
//!     6,
//!     CompressionThreshold::from_setting(256),
//!     DEFAULT_MAX_DECOMPRESSION_SIZE,
//! ));
//! let mut pool = WorkerPool::new(PoolConfig::with_size(2))?;
//!
//! let promise = CompressBatchPromise::new();
//! pool.submit_task(Box::new(CompressBatchTask::new(bytes, promise.clone(), compressor)))?;
//!
//! // Once per tick:
//! pool.collect_tasks();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod compression;
pub mod error;
pub mod pool;
pub mod sync;

pub use compression::{
    CompressionThreshold, Compressor, DeflateCompressor, Lz4Compressor,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_DECOMPRESSION_SIZE,
};
pub use error::{CompressError, DecodeError, PoolError, PoolResult, PromiseError, TaskError};
pub use pool::{
    AsyncTask, CompressBatchTask, PoolConfig, PoolStats, ShutdownReport, WorkerContext, WorkerPool,
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_WORKER_MEMORY_LIMIT_MB,
};
pub use sync::{CompressBatchPromise, NotifierId, Settled, SleeperHandler, SleeperNotifier};
