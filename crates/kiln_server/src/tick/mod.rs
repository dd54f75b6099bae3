//! # Tick Scheduler
//!
//! Fixed-rate loop on the tick thread (20 Hz by default).
//!
//! ## Per-tick order
//!
//! ```text
//! now < deadline - period/2 ? ──yes──> skip (woken early)
//!        │ no
//! tick += 1
//! scheduled jobs ─> async results ─> world ─> network
//! every second:   status line, query info, bandwidth rotation
//! every tick:     usage countdown
//! every 5 s:      cache clear, overload warning
//! every tick:     memory check
//! record TPS/load ─> advance deadline (resync after > 1 s behind)
//! ```
//!
//! Between ticks the loop sleeps in [`SleeperHandler::sleep_until`], which
//! wakes early for notifier callbacks.

mod clock;
mod deadline;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use deadline::{DeadlineAdvance, TickDeadline, RESYNC_THRESHOLD};
pub use stats::TickStats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::SleeperHandler;

use crate::config::DEFAULT_TICKS_PER_SECOND;

/// Status windows between maintenance passes.
const MAINTENANCE_WINDOWS: u64 = 5;

/// The work one tick performs, in the order the scheduler calls it.
///
/// Every hook defaults to a no-op.
pub trait TickHandler {
    /// Runs jobs due at `tick`.
    fn run_scheduled_jobs(&mut self, _tick: u64) {}

    /// Settles finished worker tasks.
    fn collect_async_results(&mut self) {}

    /// Advances the simulation.
    fn tick_world(&mut self, _tick: u64) {}

    /// Drives network interfaces.
    fn tick_network(&mut self, _tick: u64) {}

    /// Once per second: status line, query info, bandwidth rotation.
    fn on_status_window(&mut self, _tick: u64, _stats: &TickStats) {}

    /// Every tick: usage report countdown.
    fn on_usage_tick(&mut self, _tick: u64) {}

    /// Every few seconds: cache trimming.
    fn on_maintenance(&mut self, _tick: u64) {}

    /// Every tick: memory pressure check.
    fn check_memory(&mut self, _tick: u64) {}
}

/// Lifecycle of the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created, not yet started.
    Starting,
    /// Ticking.
    Running,
    /// Stop requested; the loop exits after the current tick.
    Stopping,
    /// Loop exited.
    Stopped,
}

/// What [`TickScheduler::tick`] did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickOutcome {
    /// The scheduler is not running.
    NotRunning,
    /// Too early; nothing ran.
    Skipped,
    /// A tick ran.
    Completed {
        /// Tick number.
        tick: u64,
        /// Time spent in the tick.
        elapsed: Duration,
        /// The deadline was reset after a long stall.
        resynced: bool,
    },
}

/// Cloneable stop switch for a running loop.
#[derive(Clone, Debug)]
pub struct RunHandle {
    running: Arc<AtomicBool>,
}

impl RunHandle {
    /// Asks the loop to exit after the current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Returns true until [`RunHandle::stop`] is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Drives a [`TickHandler`] at a fixed rate.
#[derive(Debug)]
pub struct TickScheduler<C: Clock = SystemClock> {
    clock: C,
    state: SchedulerState,
    running: Arc<AtomicBool>,
    deadline: TickDeadline,
    stats: TickStats,
    tick_counter: u64,
    status_interval: u64,
    maintenance_interval: u64,
    overload_tps: f64,
    overload_warnings: u64,
    resyncs: u64,
}

impl TickScheduler<SystemClock> {
    /// Creates a scheduler on the real clock.
    #[must_use]
    pub fn new(ticks_per_second: u32, overload_tps: f64) -> Self {
        Self::with_clock(SystemClock, ticks_per_second, overload_tps)
    }
}

impl<C: Clock> TickScheduler<C> {
    /// Creates a scheduler on `clock`. A rate of zero falls back to 20.
    pub fn with_clock(clock: C, ticks_per_second: u32, overload_tps: f64) -> Self {
        let ticks_per_second = if ticks_per_second == 0 {
            DEFAULT_TICKS_PER_SECOND
        } else {
            ticks_per_second
        };
        let period = Duration::from_secs(1) / ticks_per_second;
        let status_interval = u64::from(ticks_per_second);
        let start = clock.now();
        Self {
            clock,
            state: SchedulerState::Starting,
            running: Arc::new(AtomicBool::new(false)),
            deadline: TickDeadline::new(start, period),
            stats: TickStats::new(ticks_per_second),
            tick_counter: 0,
            status_interval,
            maintenance_interval: status_interval * MAINTENANCE_WINDOWS,
            overload_tps,
            overload_warnings: 0,
            resyncs: 0,
        }
    }

    /// Stop switch for this scheduler.
    #[must_use]
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Enters `Running` with the first tick due now.
    pub fn start(&mut self) {
        self.deadline.reset(self.clock.now());
        self.running.store(true, Ordering::Release);
        self.state = SchedulerState::Running;
        tracing::debug!(period = ?self.deadline.period(), "Tick scheduler started");
    }

    /// Runs one tick if one is due.
    pub fn tick<H: TickHandler + ?Sized>(&mut self, handler: &mut H) -> TickOutcome {
        if self.state != SchedulerState::Running {
            return TickOutcome::NotRunning;
        }
        if !self.running.load(Ordering::Acquire) {
            self.state = SchedulerState::Stopping;
            return TickOutcome::NotRunning;
        }

        let tick_time = self.clock.now();
        if self.deadline.is_early(tick_time) {
            return TickOutcome::Skipped;
        }

        self.tick_counter += 1;
        let tick = self.tick_counter;

        handler.run_scheduled_jobs(tick);
        handler.collect_async_results();
        handler.tick_world(tick);
        handler.tick_network(tick);

        if tick % self.status_interval == 0 {
            handler.on_status_window(tick, &self.stats);
            self.stats.reset_current();
        }

        handler.on_usage_tick(tick);

        if tick % self.maintenance_interval == 0 {
            handler.on_maintenance(tick);
            let average = self.stats.tps_average();
            if average < self.overload_tps {
                self.overload_warnings += 1;
                tracing::warn!(tps = average, "Can't keep up! Is the server overloaded?");
            }
        }

        handler.check_memory(tick);

        let elapsed = self.clock.now().saturating_duration_since(tick_time);
        self.stats.record(tick, elapsed);

        let resynced = self.deadline.advance(tick_time) == DeadlineAdvance::Resynced;
        if resynced {
            self.resyncs += 1;
            tracing::debug!(tick, "Tick deadline resynchronised after a stall");
        }

        TickOutcome::Completed {
            tick,
            elapsed,
            resynced,
        }
    }

    /// Ticks until stopped, sleeping between ticks.
    ///
    /// Notifier callbacks registered on `sleeper` run on this thread while
    /// it waits for the next deadline.
    pub fn run<H: TickHandler>(&mut self, handler: &mut H, sleeper: &mut SleeperHandler<H>) {
        self.start();
        tracing::info!(
            ticks_per_second = self.status_interval,
            "Tick loop running"
        );

        while self.running.load(Ordering::Acquire) {
            self.tick(handler);
            let wait = self.deadline.next().saturating_duration_since(self.clock.now());
            sleeper.sleep_until(Instant::now() + wait, handler);
        }

        self.state = SchedulerState::Stopped;
        tracing::info!(ticks = self.tick_counter, "Tick loop stopped");
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SchedulerState {
        self.state
    }

    /// Ticks completed so far.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Rolling statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// When the next tick is due.
    #[must_use]
    pub const fn next_deadline(&self) -> Instant {
        self.deadline.next()
    }

    /// Overload warnings logged so far.
    #[must_use]
    pub const fn overload_warnings(&self) -> u64 {
        self.overload_warnings
    }

    /// Deadline resets after stalls.
    #[must_use]
    pub const fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// The clock driving this scheduler.
    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
    }

    impl TickHandler for Recorder {
        fn run_scheduled_jobs(&mut self, _tick: u64) {
            self.calls.push("jobs");
        }

        fn collect_async_results(&mut self) {
            self.calls.push("collect");
        }

        fn tick_world(&mut self, _tick: u64) {
            self.calls.push("world");
        }

        fn tick_network(&mut self, _tick: u64) {
            self.calls.push("network");
        }

        fn on_status_window(&mut self, _tick: u64, _stats: &TickStats) {
            self.calls.push("status");
        }

        fn on_usage_tick(&mut self, _tick: u64) {
            self.calls.push("usage");
        }

        fn on_maintenance(&mut self, _tick: u64) {
            self.calls.push("maintenance");
        }

        fn check_memory(&mut self, _tick: u64) {
            self.calls.push("memory");
        }
    }

    const PERIOD: Duration = Duration::from_millis(50);

    #[test]
    fn test_not_running_before_start() {
        let mut scheduler = TickScheduler::with_clock(ManualClock::new(), 20, 12.0);
        let mut handler = Recorder::default();

        assert_eq!(scheduler.tick(&mut handler), TickOutcome::NotRunning);
        assert_eq!(scheduler.state(), SchedulerState::Starting);
        assert!(handler.calls.is_empty());
    }

    #[test]
    fn test_hook_order() {
        let clock = ManualClock::new();
        let mut scheduler = TickScheduler::with_clock(clock.clone(), 20, 12.0);
        let mut handler = Recorder::default();
        scheduler.start();

        assert!(matches!(scheduler.tick(&mut handler), TickOutcome::Completed { tick: 1, .. }));
        assert_eq!(
            handler.calls,
            vec!["jobs", "collect", "world", "network", "usage", "memory"]
        );
    }

    #[test]
    fn test_periodic_hooks() {
        let clock = ManualClock::new();
        let mut scheduler = TickScheduler::with_clock(clock.clone(), 20, 12.0);
        let mut handler = Recorder::default();
        scheduler.start();

        for _ in 0..100 {
            scheduler.tick(&mut handler);
            clock.advance(PERIOD);
        }

        let count = |name: &str| handler.calls.iter().filter(|call| **call == name).count();
        assert_eq!(count("world"), 100);
        assert_eq!(count("status"), 5);
        assert_eq!(count("maintenance"), 1);
        assert_eq!(scheduler.overload_warnings(), 0);
    }

    #[test]
    fn test_early_wakeup_skips() {
        let clock = ManualClock::new();
        let mut scheduler = TickScheduler::with_clock(clock.clone(), 20, 12.0);
        let mut handler = Recorder::default();
        scheduler.start();

        scheduler.tick(&mut handler);
        clock.advance(Duration::from_millis(10));
        assert_eq!(scheduler.tick(&mut handler), TickOutcome::Skipped);

        clock.advance(Duration::from_millis(20));
        assert!(matches!(scheduler.tick(&mut handler), TickOutcome::Completed { tick: 2, .. }));
    }

    #[test]
    fn test_stop_finishes_current_tick() {
        let clock = ManualClock::new();
        let mut scheduler = TickScheduler::with_clock(clock, 20, 12.0);
        let handle = scheduler.handle();
        let mut handler = Recorder::default();
        scheduler.start();
        assert!(handle.is_running());

        handle.stop();
        assert_eq!(scheduler.tick(&mut handler), TickOutcome::NotRunning);
        assert_eq!(scheduler.state(), SchedulerState::Stopping);
    }

    #[test]
    fn test_zero_rate_falls_back() {
        let scheduler = TickScheduler::with_clock(ManualClock::new(), 0, 12.0);
        assert_eq!(scheduler.stats().window(), 20);
    }
}
