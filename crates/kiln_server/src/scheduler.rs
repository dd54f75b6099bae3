//! Tick-keyed job scheduler.
//!
//! Jobs run on the tick thread during [`JobScheduler::heartbeat`]. A job due
//! at tick `n` runs in the first heartbeat with `tick >= n`; jobs due in the
//! same tick run in scheduling order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// What a repeating job wants after it ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobControl {
    /// Run again after the period.
    Continue,
    /// Stop repeating.
    Cancel,
}

/// Handle for cancelling a scheduled job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle(u64);

type JobFn = Box<dyn FnMut(u64) -> JobControl>;

struct Job {
    period: Option<u64>,
    run: JobFn,
}

/// Delayed and repeating jobs keyed by tick number.
#[derive(Default)]
pub struct JobScheduler {
    queue: BinaryHeap<Reverse<(u64, u64)>>,
    jobs: HashMap<u64, Job>,
    next_id: u64,
    current_tick: u64,
}

impl JobScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, delay: u64, period: Option<u64>, run: JobFn) -> JobHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.jobs.insert(id, Job { period, run });
        self.queue.push(Reverse((self.current_tick + delay.max(1), id)));
        JobHandle(id)
    }

    /// Runs `job` once, `delay` ticks from now (at least one).
    pub fn schedule_delayed(&mut self, delay: u64, job: impl FnOnce(u64) + 'static) -> JobHandle {
        let mut job = Some(job);
        self.insert(
            delay,
            None,
            Box::new(move |tick| {
                if let Some(job) = job.take() {
                    job(tick);
                }
                JobControl::Cancel
            }),
        )
    }

    /// Runs `job` after `delay` ticks, then every `period` ticks (at least one)
    /// until it returns [`JobControl::Cancel`] or is cancelled.
    pub fn schedule_repeating(
        &mut self,
        delay: u64,
        period: u64,
        job: impl FnMut(u64) -> JobControl + 'static,
    ) -> JobHandle {
        self.insert(delay, Some(period.max(1)), Box::new(job))
    }

    /// Cancels a job. Returns false if it already finished or was cancelled.
    pub fn cancel(&mut self, handle: JobHandle) -> bool {
        self.jobs.remove(&handle.0).is_some()
    }

    /// Cancels every job.
    pub fn cancel_all(&mut self) {
        self.jobs.clear();
        self.queue.clear();
    }

    /// Runs every job due at or before `tick`. Returns how many ran.
    pub fn heartbeat(&mut self, tick: u64) -> usize {
        self.current_tick = tick;
        let mut ran = 0;

        while let Some(&Reverse((due, id))) = self.queue.peek() {
            if due > tick {
                break;
            }
            self.queue.pop();

            // Cancelled jobs leave a stale heap entry behind.
            let Some(mut job) = self.jobs.remove(&id) else {
                continue;
            };

            let control = (job.run)(tick);
            ran += 1;

            if let (Some(period), JobControl::Continue) = (job.period, control) {
                self.jobs.insert(id, job);
                self.queue.push(Reverse((tick + period, id)));
            }
        }
        ran
    }

    /// Jobs still scheduled.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("pending", &self.jobs.len())
            .field("current_tick", &self.current_tick)
            .finish_non_exhaustive()
    }
}
