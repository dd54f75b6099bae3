//! Global memory pressure check.

/// Compares worker memory against an optional soft limit.
#[derive(Debug)]
pub struct MemoryManager {
    soft_limit: Option<usize>,
    check_rate: u64,
    over: bool,
}

impl MemoryManager {
    /// Creates a manager checking every `check_rate` ticks.
    #[must_use]
    pub fn new(soft_limit: Option<usize>, check_rate: u64) -> Self {
        Self {
            soft_limit,
            check_rate: check_rate.max(1),
            over: false,
        }
    }

    /// Returns true while usage is above the soft limit.
    #[must_use]
    pub const fn is_under_pressure(&self) -> bool {
        self.over
    }

    /// Checks `usage` on ticks that are a multiple of the check rate.
    ///
    /// Returns true only on the check that first crosses the limit.
    pub fn check(&mut self, tick: u64, usage: usize) -> bool {
        let Some(limit) = self.soft_limit else {
            return false;
        };
        if tick % self.check_rate != 0 {
            return false;
        }

        let over = usage > limit;
        let crossed = over && !self.over;
        if crossed {
            tracing::warn!(usage, limit, "Worker memory above soft limit");
        } else if self.over && !over {
            tracing::info!(usage, limit, "Worker memory back under soft limit");
        }
        self.over = over;
        crossed
    }
}
