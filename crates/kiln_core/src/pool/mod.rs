//! # Worker Pool
//!
//! **Fixed set of background threads for CPU-heavy tasks.**
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──inbox──> [kiln-worker-0] ──┐
//!   tick thread ───┼──inbox──> [kiln-worker-1] ──┼──> completion queue ──> collect_tasks()
//!   submit_task()  └──inbox──> [kiln-worker-N] ──┘                         (tick thread)
//! ```
//!
//! Every worker has its own inbox; all of them share one completion queue.
//! Completion callbacks only run inside [`WorkerPool::collect_tasks`], so the
//! thread that owns the game state is the only one that ever settles a
//! promise.
//!
//! ## Memory Recycling
//!
//! Each worker publishes the memory held by its [`WorkerContext`] after every
//! task. A worker above the hard limit is replaced before it receives its next
//! task: the old thread finishes what is already queued, then exits.

mod task;
mod worker;

pub use task::{scratch_key, AsyncTask, CompressBatchTask};
pub use worker::WorkerContext;

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{PoolError, PoolResult, TaskError};
use worker::{Completion, WorkerExit, WorkerHandle};

/// Default per-worker memory hard limit in megabytes.
pub const DEFAULT_WORKER_MEMORY_LIMIT_MB: i64 = 256;

/// How long `Drop` waits for workers to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const MIB: usize = 1024 * 1024;

/// Worker pool configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub size: usize,
    /// Per-worker memory hard limit in bytes (`None` = unlimited).
    pub worker_memory_limit: Option<usize>,
}

impl PoolConfig {
    /// `size` workers with the default memory limit.
    #[must_use]
    pub fn with_size(size: usize) -> Self {
        Self::from_limit_mb(size, DEFAULT_WORKER_MEMORY_LIMIT_MB)
    }

    /// `size` workers with a limit given in megabytes (negative = unlimited).
    #[must_use]
    pub fn from_limit_mb(size: usize, limit_mb: i64) -> Self {
        Self {
            size,
            worker_memory_limit: usize::try_from(limit_mb)
                .ok()
                .map(|mb| mb.saturating_mul(MIB)),
        }
    }

    /// Removes the memory limit.
    #[must_use]
    pub fn unlimited(mut self) -> Self {
        self.worker_memory_limit = None;
        self
    }

    /// Worker count used for `async_workers = "auto"`.
    ///
    /// Available cores minus two (one for the tick thread, one for I/O), at
    /// least one. Falls back to two when the core count is unknown.
    #[must_use]
    pub fn default_worker_count() -> usize {
        std::thread::available_parallelism()
            .map_or(2, |cores| cores.get().saturating_sub(2).max(1))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::with_size(Self::default_worker_count())
    }
}

/// Lifetime counters for a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks accepted by `submit_task*`.
    pub submitted: u64,
    /// Tasks whose `on_run` returned `Ok`.
    pub completed: u64,
    /// Tasks that returned an error or panicked.
    pub failed: u64,
    /// Workers replaced for exceeding the memory limit.
    pub recycled: u64,
}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that exited and were joined.
    pub stopped: usize,
    /// Workers still running at the deadline, detached.
    pub abandoned: usize,
}

impl ShutdownReport {
    /// Returns true if every worker was joined.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.abandoned == 0
    }
}

/// Pool of worker threads.
///
/// Owned by the tick thread; not `Sync`.
pub struct WorkerPool {
    config: PoolConfig,
    workers: Vec<WorkerHandle>,
    /// Recycled workers still draining their inbox.
    retired: Vec<WorkerHandle>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    exit_tx: Sender<WorkerExit>,
    exit_rx: Receiver<WorkerExit>,
    next_generation: u64,
    shut_down: bool,
    stats: PoolStats,
}

impl WorkerPool {
    /// Starts `config.size` workers.
    pub fn new(config: PoolConfig) -> PoolResult<Self> {
        if config.size == 0 {
            return Err(PoolError::InvalidSize(0));
        }

        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();

        let mut pool = Self {
            workers: Vec::with_capacity(config.size),
            config,
            retired: Vec::new(),
            completion_tx,
            completion_rx,
            exit_tx,
            exit_rx,
            next_generation: 0,
            shut_down: false,
            stats: PoolStats::default(),
        };

        for slot in 0..pool.config.size {
            let worker = pool.spawn_worker(slot)?;
            pool.workers.push(worker);
        }

        tracing::info!(
            workers = pool.config.size,
            memory_limit = ?pool.config.worker_memory_limit,
            "Worker pool started"
        );
        Ok(pool)
    }

    fn spawn_worker(&mut self, slot: usize) -> PoolResult<WorkerHandle> {
        let generation = self.next_generation;
        self.next_generation += 1;
        WorkerHandle::spawn(
            slot,
            generation,
            self.completion_tx.clone(),
            self.exit_tx.clone(),
        )
    }

    /// Submits a task to the least-loaded worker and returns its slot.
    ///
    /// Ties go to the lowest slot. Never blocks.
    pub fn submit_task(&mut self, task: Box<dyn AsyncTask>) -> PoolResult<usize> {
        if self.shut_down {
            return Err(PoolError::ShutDown);
        }
        let slot = self
            .workers
            .iter()
            .min_by_key(|worker| (worker.pending(), worker.slot()))
            .map_or(0, WorkerHandle::slot);
        self.submit_task_to_worker(task, slot)?;
        Ok(slot)
    }

    /// Submits a task to a specific worker slot.
    pub fn submit_task_to_worker(&mut self, task: Box<dyn AsyncTask>, slot: usize) -> PoolResult<()> {
        if self.shut_down {
            return Err(PoolError::ShutDown);
        }
        if slot >= self.workers.len() {
            return Err(PoolError::InvalidSlot {
                slot,
                size: self.workers.len(),
            });
        }

        if self.is_over_limit(slot) {
            tracing::info!(
                slot,
                usage = self.workers[slot].memory_usage(),
                "Worker exceeded memory limit, recycling"
            );
            self.replace_worker(slot)?;
            self.stats.recycled += 1;
        }

        let rejected = match self.workers[slot].send(task) {
            Ok(()) => None,
            Err(message) => message.into_task(),
        };

        if let Some(task) = rejected {
            tracing::warn!(slot, task = task.name(), "Worker inbox closed, respawning");
            self.replace_worker(slot)?;
            if let Some(task) = self.workers[slot].send(task).err().and_then(|m| m.into_task()) {
                task.on_completion(Err(TaskError::Failed(format!("worker {slot} unavailable"))));
                return Err(PoolError::Spawn(format!("worker {slot} refused work after respawn")));
            }
        }

        self.stats.submitted += 1;
        Ok(())
    }

    fn is_over_limit(&self, slot: usize) -> bool {
        self.config
            .worker_memory_limit
            .is_some_and(|limit| self.workers[slot].memory_usage() > limit)
    }

    /// Puts a fresh worker in `slot` and retires the old one.
    fn replace_worker(&mut self, slot: usize) -> PoolResult<()> {
        let replacement = self.spawn_worker(slot)?;
        let mut old = std::mem::replace(&mut self.workers[slot], replacement);
        old.stop();
        tracing::debug!(
            slot,
            old_generation = old.generation(),
            pending = old.pending(),
            "Worker retired"
        );
        self.retired.push(old);
        Ok(())
    }

    /// Runs `on_completion` for every finished task. Call once per tick.
    ///
    /// Returns the number of tasks collected.
    pub fn collect_tasks(&mut self) -> usize {
        let collected = self.drain_completions();
        self.reap_exited();
        collected
    }

    fn drain_completions(&mut self) -> usize {
        let mut collected = 0;
        while let Ok(completion) = self.completion_rx.try_recv() {
            let Completion {
                slot,
                generation,
                task,
                outcome,
            } = completion;

            if let Some(worker) = self
                .workers
                .iter_mut()
                .chain(self.retired.iter_mut())
                .find(|worker| worker.matches(slot, generation))
            {
                worker.completed_one();
            }

            if outcome.is_ok() {
                self.stats.completed += 1;
            } else {
                self.stats.failed += 1;
            }
            task.on_completion(outcome);
            collected += 1;
        }
        collected
    }

    fn reap_exited(&mut self) {
        while let Ok(exit) = self.exit_rx.try_recv() {
            if let Some(pos) = self
                .retired
                .iter()
                .position(|worker| worker.matches(exit.slot, exit.generation))
            {
                let mut worker = self.retired.swap_remove(pos);
                worker.join();
                tracing::debug!(slot = exit.slot, generation = exit.generation, "Retired worker joined");
            } else if self
                .workers
                .iter()
                .any(|worker| worker.matches(exit.slot, exit.generation))
            {
                tracing::warn!(slot = exit.slot, "Worker exited unexpectedly, will respawn on next submit");
            }
        }
    }

    /// Total memory reported by active workers, in bytes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.workers.iter().map(WorkerHandle::memory_usage).sum()
    }

    /// Memory reported by one worker slot.
    #[must_use]
    pub fn worker_memory_usage(&self, slot: usize) -> Option<usize> {
        self.workers.get(slot).map(WorkerHandle::memory_usage)
    }

    /// Tasks submitted but not yet collected, including those on retired workers.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.workers
            .iter()
            .chain(self.retired.iter())
            .map(WorkerHandle::pending)
            .sum()
    }

    /// Number of worker slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Returns the pool configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns lifetime counters.
    #[must_use]
    pub const fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Returns true once `shutdown` has run.
    #[must_use]
    pub const fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Grows the pool to `new_size` workers. Shrinking is not supported.
    pub fn increase_size(&mut self, new_size: usize) -> PoolResult<()> {
        if self.shut_down {
            return Err(PoolError::ShutDown);
        }
        if new_size < self.workers.len() {
            return Err(PoolError::InvalidSize(new_size));
        }
        for slot in self.workers.len()..new_size {
            let worker = self.spawn_worker(slot)?;
            self.workers.push(worker);
        }
        self.config.size = new_size;
        tracing::info!(workers = new_size, "Worker pool resized");
        Ok(())
    }

    /// Stops every worker, waiting up to `timeout` for them to exit.
    ///
    /// Queued tasks still run and their completions are collected while
    /// waiting. Workers still busy at the deadline are detached. Calling this
    /// twice is a no-op.
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        if self.shut_down {
            return ShutdownReport::default();
        }
        self.shut_down = true;

        let mut running: Vec<WorkerHandle> =
            self.workers.drain(..).chain(self.retired.drain(..)).collect();
        for worker in &mut running {
            worker.stop();
        }

        let deadline = Instant::now() + timeout;
        let mut stopped = 0;
        while !running.is_empty() {
            self.drain_completions();

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.exit_rx.recv_timeout((deadline - now).min(Duration::from_millis(10))) {
                Ok(exit) => {
                    if let Some(pos) = running
                        .iter()
                        .position(|worker| worker.matches(exit.slot, exit.generation))
                    {
                        running.swap_remove(pos).join();
                        stopped += 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.drain_completions();

        let abandoned = running.len();
        if abandoned > 0 {
            tracing::warn!(
                abandoned,
                timeout_ms = timeout.as_millis(),
                "Worker pool shutdown timed out, detaching busy workers"
            );
            for worker in &mut running {
                worker.detach();
            }
        } else {
            tracing::info!(stopped, "Worker pool stopped");
        }

        ShutdownReport { stopped, abandoned }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .field("retired", &self.retired.len())
            .field("pending", &self.pending_tasks())
            .field("shut_down", &self.shut_down)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
