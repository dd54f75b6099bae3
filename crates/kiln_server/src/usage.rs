//! Anonymous usage reporting.
//!
//! Reports are built on the tick thread and handed to a [`UsageSink`]. The
//! default sink only logs them; deployments that actually ship statistics
//! override the sink through the [`crate::api::ApiRegistry`].

use std::collections::HashSet;

use serde::Serialize;

use crate::session::SessionId;

/// Why a report was sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// Server started.
    Open,
    /// Periodic status.
    Status,
    /// Server stopping.
    Close,
}

/// One usage report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageReport {
    /// Report kind.
    pub kind: UsageKind,
    /// Configured server name.
    pub server_name: String,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Distinct sessions seen since the previous report.
    pub unique_sessions: usize,
    /// Sessions online now.
    pub online: usize,
    /// Session cap.
    pub max_sessions: usize,
    /// Rolling TPS average.
    pub tps_average: f64,
    /// Rolling load in percent.
    pub load_percent: f64,
    /// Async worker count.
    pub worker_count: usize,
}

/// Destination for usage reports.
pub trait UsageSink: Send + Sync {
    /// Delivers one report. Must not block the tick thread for long.
    fn submit(&self, report: &UsageReport);
}

/// Sink that writes reports to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn submit(&self, report: &UsageReport) {
        match toml::to_string(report) {
            Ok(body) => tracing::debug!(kind = ?report.kind, "Usage report\n{body}"),
            Err(error) => tracing::warn!(%error, "Failed to encode usage report"),
        }
    }
}

/// Countdown and unique-session bookkeeping between reports.
#[derive(Debug)]
pub struct UsageTracker {
    enabled: bool,
    interval: u64,
    countdown: u64,
    unique: HashSet<SessionId>,
}

impl UsageTracker {
    /// Creates a tracker that fires every `interval` ticks when `enabled`.
    #[must_use]
    pub fn new(enabled: bool, interval: u64) -> Self {
        let interval = interval.max(1);
        Self {
            enabled,
            interval,
            countdown: interval,
            unique: HashSet::new(),
        }
    }

    /// Returns true if reports are sent at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Notes a session for the next report.
    pub fn record_session(&mut self, id: SessionId) {
        if self.enabled {
            self.unique.insert(id);
        }
    }

    /// Advances the countdown. Returns true when a status report is due.
    pub fn tick(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = self.interval;
            return true;
        }
        false
    }

    /// Returns and resets the unique session count.
    pub fn take_unique(&mut self) -> usize {
        let count = self.unique.len();
        self.unique.clear();
        count
    }
}
