//! Next-tick deadline with drift correction.

use std::time::{Duration, Instant};

/// Lateness after which the schedule is reset instead of caught up.
pub const RESYNC_THRESHOLD: Duration = Duration::from_secs(1);

/// How the deadline moved after a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadlineAdvance {
    /// Moved forward by one period.
    Scheduled,
    /// Reset to the tick time after a long stall.
    Resynced,
}

/// When the next tick is due.
#[derive(Clone, Copy, Debug)]
pub struct TickDeadline {
    next: Instant,
    period: Duration,
    skip_window: Duration,
}

impl TickDeadline {
    /// First tick due at `start`.
    #[must_use]
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            next: start,
            period,
            skip_window: period / 2,
        }
    }

    /// Instant the next tick is due.
    #[must_use]
    pub const fn next(&self) -> Instant {
        self.next
    }

    /// Tick period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Returns true if `now` is more than half a period before the deadline.
    ///
    /// Early wake-ups (notifiers) land here; the tick is skipped.
    #[must_use]
    pub fn is_early(&self, now: Instant) -> bool {
        self.next.saturating_duration_since(now) > self.skip_window
    }

    /// Moves the deadline after a tick that started at `tick_time`.
    ///
    /// Up to a second behind, the schedule catches up one period at a time.
    /// Further behind, it restarts from `tick_time`.
    pub fn advance(&mut self, tick_time: Instant) -> DeadlineAdvance {
        if tick_time.saturating_duration_since(self.next) > RESYNC_THRESHOLD {
            self.next = tick_time;
            DeadlineAdvance::Resynced
        } else {
            self.next += self.period;
            DeadlineAdvance::Scheduled
        }
    }

    /// Restarts the schedule at `start`.
    pub fn reset(&mut self, start: Instant) {
        self.next = start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(50);

    #[test]
    fn test_skip_window_is_half_period() {
        let start = Instant::now();
        let deadline = TickDeadline::new(start + PERIOD, PERIOD);

        assert!(deadline.is_early(start));
        assert!(deadline.is_early(start + Duration::from_millis(24)));
        assert!(!deadline.is_early(start + Duration::from_millis(25)));
        assert!(!deadline.is_early(start + Duration::from_millis(80)));
    }

    #[test]
    fn test_small_lag_catches_up() {
        let start = Instant::now();
        let mut deadline = TickDeadline::new(start, PERIOD);

        let late = start + Duration::from_millis(900);
        assert_eq!(deadline.advance(late), DeadlineAdvance::Scheduled);
        assert_eq!(deadline.next(), start + PERIOD);
    }

    #[test]
    fn test_long_stall_resyncs() {
        let start = Instant::now();
        let mut deadline = TickDeadline::new(start, PERIOD);

        let stalled = start + Duration::from_secs(2);
        assert_eq!(deadline.advance(stalled), DeadlineAdvance::Resynced);
        assert_eq!(deadline.next(), stalled);
    }
}
