//! Rolling TPS and load statistics.

use std::time::Duration;

/// Per-tick TPS and load samples over a one-second window.
#[derive(Clone, Debug)]
pub struct TickStats {
    max_tps: f64,
    period_secs: f64,
    tps_samples: Vec<f64>,
    use_samples: Vec<f64>,
    current_tps: f64,
    current_use: f64,
}

impl TickStats {
    /// Stats for a loop running at `ticks_per_second`.
    ///
    /// The window starts full of perfect samples (max TPS, zero load).
    #[must_use]
    pub fn new(ticks_per_second: u32) -> Self {
        let ticks_per_second = ticks_per_second.max(1);
        let window = ticks_per_second as usize;
        let max_tps = f64::from(ticks_per_second);
        Self {
            max_tps,
            period_secs: 1.0 / max_tps,
            tps_samples: vec![max_tps; window],
            use_samples: vec![0.0; window],
            current_tps: max_tps,
            current_use: 0.0,
        }
    }

    /// Records how long tick `tick` took.
    pub fn record(&mut self, tick: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.current_tps = self.max_tps.min(1.0 / secs.max(0.001));
        self.current_use = 1.0_f64.min(secs / self.period_secs);

        let slot = (tick % self.tps_samples.len() as u64) as usize;
        self.tps_samples[slot] = self.current_tps;
        self.use_samples[slot] = self.current_use;
    }

    /// Resets the current values at the start of a status window.
    pub fn reset_current(&mut self) {
        self.current_tps = self.max_tps;
        self.current_use = 0.0;
    }

    /// TPS of the last recorded tick.
    #[must_use]
    pub const fn current_tps(&self) -> f64 {
        self.current_tps
    }

    /// Load fraction of the last recorded tick.
    #[must_use]
    pub const fn current_use(&self) -> f64 {
        self.current_use
    }

    /// Mean TPS over the window, rounded to two decimals.
    #[must_use]
    pub fn tps_average(&self) -> f64 {
        round2(mean(&self.tps_samples))
    }

    /// Mean load fraction over the window.
    #[must_use]
    pub fn use_average(&self) -> f64 {
        mean(&self.use_samples)
    }

    /// Mean load in percent, rounded to two decimals.
    #[must_use]
    pub fn load_percent(&self) -> f64 {
        round2(self.use_average() * 100.0)
    }

    /// Samples in the window.
    #[must_use]
    pub fn window(&self) -> usize {
        self.tps_samples.len()
    }
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
