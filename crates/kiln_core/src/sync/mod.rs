//! # Synchronization Between the Tick Thread and Everyone Else
//!
//! ## The Problem
//!
//! ```text
//! Tick thread:    owns sessions, world, promises      (must never block on work)
//! Worker threads: compress batches                    (must never touch game state)
//! Console thread: reads stdin                         (must never mutate the server)
//! ```
//!
//! ## The Solution
//!
//! ```text
//! Worker  --result-->  completion queue  --collect_tasks()-->  promise.resolve()   (tick thread)
//! Console --request--> request queue + SleeperNotifier --wake--> callback           (tick thread)
//! ```
//!
//! Every callback that mutates server state runs on the tick thread. The only
//! blocking point there is [`SleeperHandler::sleep_until`], and any notifier
//! can cut it short.

mod promise;
mod sleeper;

pub use promise::{CompressBatchPromise, Settled};
pub use sleeper::{NotifierId, SleeperHandler, SleeperNotifier};
