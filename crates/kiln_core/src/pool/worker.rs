//! Worker threads and their per-thread state.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use super::task::AsyncTask;
use crate::error::{PoolError, PoolResult, TaskError};

/// Worker-local state handed to every task run on that worker.
///
/// Tasks may park values in the store between runs (codec scratch buffers,
/// dictionaries). The declared size of every stored value counts toward the
/// worker's memory usage, which the pool compares against its hard limit.
pub struct WorkerContext {
    slot: usize,
    store: HashMap<String, (Box<dyn Any + Send>, usize)>,
    memory_usage: usize,
}

impl WorkerContext {
    /// Creates an empty context for `slot`.
    #[must_use]
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            store: HashMap::new(),
            memory_usage: 0,
        }
    }

    /// Returns the worker slot this context belongs to.
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Stores `value` under `key`, accounting `size_bytes` of memory.
    ///
    /// Replaces (and un-accounts) any previous value under the same key.
    pub fn save_to_store<T: Any + Send>(&mut self, key: impl Into<String>, value: T, size_bytes: usize) {
        if let Some((_, old_size)) = self.store.insert(key.into(), (Box::new(value), size_bytes)) {
            self.memory_usage -= old_size;
        }
        self.memory_usage += size_bytes;
    }

    /// Borrows a stored value if present and of type `T`.
    #[must_use]
    pub fn fetch_from_store<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.store.get(key).and_then(|(value, _)| value.downcast_ref::<T>())
    }

    /// Mutably borrows a stored value if present and of type `T`.
    pub fn fetch_from_store_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.store
            .get_mut(key)
            .and_then(|(value, _)| value.downcast_mut::<T>())
    }

    /// Moves a stored value out if present and of type `T`.
    ///
    /// A value of another type is left in place.
    pub fn take_from_store<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        let (value, size) = self.store.remove(key)?;
        match value.downcast::<T>() {
            Ok(value) => {
                self.memory_usage -= size;
                Some(*value)
            }
            Err(value) => {
                self.store.insert(key.to_string(), (value, size));
                None
            }
        }
    }

    /// Removes a stored value. Returns true if something was removed.
    pub fn remove_from_store(&mut self, key: &str) -> bool {
        match self.store.remove(key) {
            Some((_, size)) => {
                self.memory_usage -= size;
                true
            }
            None => false,
        }
    }

    /// Drops every stored value.
    pub fn clear_store(&mut self) {
        self.store.clear();
        self.memory_usage = 0;
    }

    /// Returns the accounted memory in bytes.
    #[must_use]
    pub const fn memory_usage(&self) -> usize {
        self.memory_usage
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("slot", &self.slot)
            .field("entries", &self.store.len())
            .field("memory_usage", &self.memory_usage)
            .finish()
    }
}

/// Message in a worker inbox.
pub(crate) enum WorkerMessage {
    Run(Box<dyn AsyncTask>),
    /// Queued behind pending work; the worker exits when it reaches it.
    Stop,
}

impl WorkerMessage {
    pub(crate) fn into_task(self) -> Option<Box<dyn AsyncTask>> {
        match self {
            Self::Run(task) => Some(task),
            Self::Stop => None,
        }
    }
}

/// A finished task travelling back to the tick thread.
pub(crate) struct Completion {
    pub slot: usize,
    pub generation: u64,
    pub task: Box<dyn AsyncTask>,
    pub outcome: Result<(), TaskError>,
}

/// Sent by a worker thread as it exits, panicking or not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WorkerExit {
    pub slot: usize,
    pub generation: u64,
}

struct ExitGuard {
    exits: Sender<WorkerExit>,
    exit: WorkerExit,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.exits.send(self.exit);
    }
}

/// Tick-thread side of one worker thread.
pub(crate) struct WorkerHandle {
    slot: usize,
    generation: u64,
    inbox: Sender<WorkerMessage>,
    memory: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
    pending: usize,
    stopping: bool,
}

impl WorkerHandle {
    /// Starts a worker thread for `slot`.
    pub(crate) fn spawn(
        slot: usize,
        generation: u64,
        completions: Sender<Completion>,
        exits: Sender<WorkerExit>,
    ) -> PoolResult<Self> {
        let (inbox, receiver) = crossbeam_channel::unbounded();
        let memory = Arc::new(AtomicUsize::new(0));
        let worker_memory = Arc::clone(&memory);

        let thread = thread::Builder::new()
            .name(format!("kiln-worker-{slot}"))
            .spawn(move || {
                let _guard = ExitGuard {
                    exits,
                    exit: WorkerExit { slot, generation },
                };
                worker_loop(slot, generation, &receiver, &completions, &worker_memory);
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        tracing::debug!(slot, generation, "Worker started");

        Ok(Self {
            slot,
            generation,
            inbox,
            memory,
            thread: Some(thread),
            pending: 0,
            stopping: false,
        })
    }

    /// Queues a task. Hands the message back if the worker is gone or stopping.
    pub(crate) fn send(&mut self, task: Box<dyn AsyncTask>) -> Result<(), WorkerMessage> {
        if self.stopping {
            return Err(WorkerMessage::Run(task));
        }
        self.inbox
            .send(WorkerMessage::Run(task))
            .map_err(|crossbeam_channel::SendError(message)| message)?;
        self.pending += 1;
        Ok(())
    }

    /// Queues the stop message behind any pending work.
    pub(crate) fn stop(&mut self) {
        if !self.stopping {
            self.stopping = true;
            let _ = self.inbox.send(WorkerMessage::Stop);
        }
    }

    /// Joins the thread. Only call once its exit has been observed.
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(slot = self.slot, "Worker thread panicked outside a task");
            }
        }
    }

    /// Drops the join handle, leaving the thread running on its own.
    pub(crate) fn detach(&mut self) {
        self.thread.take();
    }

    pub(crate) fn completed_one(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    pub(crate) fn matches(&self, slot: usize, generation: u64) -> bool {
        self.slot == slot && self.generation == generation
    }

    pub(crate) const fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) const fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn memory_usage(&self) -> usize {
        self.memory.load(Ordering::Acquire)
    }
}

fn worker_loop(
    slot: usize,
    generation: u64,
    inbox: &Receiver<WorkerMessage>,
    completions: &Sender<Completion>,
    memory: &AtomicUsize,
) {
    let mut ctx = WorkerContext::new(slot);

    while let Ok(message) = inbox.recv() {
        let mut task = match message {
            WorkerMessage::Run(task) => task,
            WorkerMessage::Stop => break,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.on_run(&mut ctx)))
            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));

        memory.store(ctx.memory_usage(), Ordering::Release);

        let completion = Completion {
            slot,
            generation,
            task,
            outcome,
        };
        if completions.send(completion).is_err() {
            break;
        }
    }

    tracing::debug!(slot, generation, "Worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
