//! World integration points.
//!
//! The simulation itself lives outside this crate. The tick loop only needs
//! to drive it, trim its caches and unload it at shutdown.

/// Hooks the tick loop calls into the simulation.
pub trait WorldHooks {
    /// Advances the simulation by one tick.
    fn tick(&mut self, tick: u64);

    /// Drops cached data that can be rebuilt. Called every few seconds.
    fn clear_cache(&mut self) {}

    /// Saves and unloads everything. Called once at shutdown.
    fn unload_all(&mut self) {}
}

/// A world that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopWorld;

impl WorldHooks for NoopWorld {
    fn tick(&mut self, _tick: u64) {}
}
