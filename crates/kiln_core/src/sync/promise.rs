//! # Compress-Batch Promise
//!
//! Single-assignment future over a compressed batch.
//!
//! ```text
//!   prepare_batch() ──> Pending ──resolve(bytes)──> Resolved
//!                          │
//!                          └──reject(error)──────> Rejected
//! ```
//!
//! A second `resolve`/`reject` fails with [`PromiseError::AlreadySettled`].
//! Nobody ever blocks on a promise: consumers either register an
//! [`on_settled`](CompressBatchPromise::on_settled) continuation or poll.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PromiseError, TaskError};

/// Outcome carried by a settled promise.
pub type Settled = Result<Arc<[u8]>, TaskError>;

type Continuation = Box<dyn FnOnce(&Settled) + Send>;

enum State {
    Pending(Vec<Continuation>),
    Settled(Settled),
}

/// Shared handle to a batch that is being (or has been) compressed.
///
/// Cloning is cheap: all clones observe the same settlement.
#[derive(Clone)]
pub struct CompressBatchPromise {
    state: Arc<Mutex<State>>,
}

impl CompressBatchPromise {
    /// Creates a pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Creates a promise that is already resolved with `bytes`.
    #[must_use]
    pub fn resolved(bytes: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Settled(Ok(bytes.into())))),
        }
    }

    /// Resolves the promise with the compressed batch.
    pub fn resolve(&self, bytes: Vec<u8>) -> Result<(), PromiseError> {
        self.settle(Ok(bytes.into()))
    }

    /// Rejects the promise with a task failure.
    pub fn reject(&self, error: TaskError) -> Result<(), PromiseError> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Settled) -> Result<(), PromiseError> {
        let continuations = {
            let mut state = self.state.lock();
            let waiting = match &mut *state {
                State::Settled(_) => return Err(PromiseError::AlreadySettled),
                State::Pending(waiting) => std::mem::take(waiting),
            };
            *state = State::Settled(outcome.clone());
            waiting
        };

        // Continuations run outside the lock so they may inspect this promise.
        for continuation in continuations {
            continuation(&outcome);
        }
        Ok(())
    }

    /// Registers a continuation for the settlement.
    ///
    /// Runs immediately (on the calling thread) if the promise has already
    /// settled, otherwise on whichever thread settles it. In the pipeline that
    /// is always the tick thread.
    pub fn on_settled(&self, continuation: impl FnOnce(&Settled) + Send + 'static) {
        let settled = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(waiting) => {
                    waiting.push(Box::new(continuation));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        continuation(&settled);
    }

    /// Returns true once resolved or rejected.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(*self.state.lock(), State::Settled(_))
    }

    /// Returns true if resolved with bytes.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), State::Settled(Ok(_)))
    }

    /// Returns true if rejected.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(*self.state.lock(), State::Settled(Err(_)))
    }

    /// Reads the compressed batch without blocking.
    ///
    /// Fails with [`PromiseError::Pending`] before settlement and
    /// [`PromiseError::Rejected`] if the task failed.
    pub fn result(&self) -> Result<Arc<[u8]>, PromiseError> {
        match &*self.state.lock() {
            State::Pending(_) => Err(PromiseError::Pending),
            State::Settled(Ok(bytes)) => Ok(Arc::clone(bytes)),
            State::Settled(Err(error)) => Err(PromiseError::Rejected(error.clone())),
        }
    }
}

impl Default for CompressBatchPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompressBatchPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            State::Pending(waiting) => format!("Pending({} continuations)", waiting.len()),
            State::Settled(Ok(bytes)) => format!("Resolved({} bytes)", bytes.len()),
            State::Settled(Err(error)) => format!("Rejected({error})"),
        };
        f.debug_struct("CompressBatchPromise")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pending_until_resolved() {
        let promise = CompressBatchPromise::new();
        assert!(!promise.is_settled());
        assert_eq!(promise.result(), Err(PromiseError::Pending));

        promise.resolve(vec![1, 2, 3]).unwrap();
        assert!(promise.is_resolved());
        assert_eq!(&*promise.result().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_double_settle_detected() {
        let promise = CompressBatchPromise::new();
        promise.resolve(vec![1]).unwrap();

        assert_eq!(promise.resolve(vec![2]), Err(PromiseError::AlreadySettled));
        assert_eq!(
            promise.reject(TaskError::Failed("late".into())),
            Err(PromiseError::AlreadySettled)
        );
        // First value wins.
        assert_eq!(&*promise.result().unwrap(), &[1]);
    }

    #[test]
    fn test_continuations_run_exactly_once() {
        let promise = CompressBatchPromise::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            promise.on_settled(move |outcome| {
                assert!(outcome.is_ok());
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        promise.resolve(vec![9; 4]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let _ = promise.resolve(vec![0]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_late_continuation_runs_immediately() {
        let promise = CompressBatchPromise::resolved(vec![5]);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        promise.on_settled(move |outcome| {
            seen_clone.store(outcome.as_ref().map(|b| b.len()).unwrap_or(0), Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejection_is_distinct() {
        let promise = CompressBatchPromise::new();
        let rejected = Arc::new(AtomicUsize::new(0));
        let rejected_clone = Arc::clone(&rejected);
        promise.on_settled(move |outcome| {
            if outcome.is_err() {
                rejected_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        promise.reject(TaskError::Failed("codec exploded".into())).unwrap();

        assert!(promise.is_rejected());
        assert!(!promise.is_resolved());
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert!(matches!(promise.result(), Err(PromiseError::Rejected(_))));
    }

    #[test]
    fn test_clones_share_state() {
        let promise = CompressBatchPromise::new();
        let observer = promise.clone();

        std::thread::spawn(move || promise.resolve(vec![4, 2]).unwrap())
            .join()
            .unwrap();

        assert!(observer.is_resolved());
    }
}
