//! Network interfaces and bandwidth accounting.
//!
//! Transports (raw sockets, proxies, test doubles) plug in as
//! [`NetworkInterface`]s. The tick thread drives them once per tick and
//! rotates the bandwidth history once per status window.

use std::collections::VecDeque;

/// Status windows of history kept per direction.
pub const DEFAULT_BANDWIDTH_HISTORY: usize = 5;

/// A transport driven by the tick thread.
pub trait NetworkInterface: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str {
        "interface"
    }

    /// Processes pending I/O, recording traffic in `bandwidth`.
    fn tick(&mut self, bandwidth: &mut BandwidthTracker);

    /// Updates the advertised server name.
    fn set_name(&mut self, name: &str);

    /// Closes every connection with `reason` and stops accepting new ones.
    fn close(&mut self, reason: &str);

    /// Open connections, including ones still handshaking.
    fn connection_count(&self) -> usize;
}

/// Bytes in one direction, averaged over the last few windows.
#[derive(Clone, Debug)]
pub struct BandwidthStats {
    history: VecDeque<u64>,
    capacity: usize,
    current: u64,
    total: u64,
}

impl BandwidthStats {
    /// Creates stats that average over `capacity` windows.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            current: 0,
            total: 0,
        }
    }

    /// Records `bytes` in the current window.
    pub fn add(&mut self, bytes: u64) {
        self.current += bytes;
        self.total += bytes;
    }

    /// Closes the current window and starts a new one.
    pub fn rotate_history(&mut self) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(self.current);
        self.current = 0;
    }

    /// Mean bytes per closed window; zero before the first rotation.
    #[must_use]
    pub fn average_bytes(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<u64>() as f64 / self.history.len() as f64
    }

    /// Bytes recorded since creation.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total
    }
}

/// Send and receive bandwidth.
#[derive(Clone, Debug)]
pub struct BandwidthTracker {
    send: BandwidthStats,
    receive: BandwidthStats,
}

impl BandwidthTracker {
    /// Creates a tracker averaging over `history` windows.
    #[must_use]
    pub fn new(history: usize) -> Self {
        Self {
            send: BandwidthStats::new(history),
            receive: BandwidthStats::new(history),
        }
    }

    /// Records outgoing bytes.
    pub fn add_sent(&mut self, bytes: u64) {
        self.send.add(bytes);
    }

    /// Records incoming bytes.
    pub fn add_received(&mut self, bytes: u64) {
        self.receive.add(bytes);
    }

    /// Outgoing stats.
    #[must_use]
    pub const fn send(&self) -> &BandwidthStats {
        &self.send
    }

    /// Incoming stats.
    #[must_use]
    pub const fn receive(&self) -> &BandwidthStats {
        &self.receive
    }

    /// Rotates both directions.
    pub fn rotate_history(&mut self) {
        self.send.rotate_history();
        self.receive.rotate_history();
    }
}

impl Default for BandwidthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BANDWIDTH_HISTORY)
    }
}

/// Every registered interface plus shared bandwidth stats.
#[derive(Default)]
pub struct Network {
    interfaces: Vec<Box<dyn NetworkInterface>>,
    bandwidth: BandwidthTracker,
    name: String,
}

impl Network {
    /// Creates a network with no interfaces.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds an interface and tells it the current name.
    pub fn register_interface(&mut self, mut interface: Box<dyn NetworkInterface>) {
        interface.set_name(&self.name);
        tracing::debug!(interface = interface.name(), "Network interface registered");
        self.interfaces.push(interface);
    }

    /// Drops every interface. Call after [`Network::close_all`].
    pub fn unregister_all(&mut self) -> usize {
        let count = self.interfaces.len();
        for interface in self.interfaces.drain(..) {
            tracing::debug!(interface = interface.name(), "Stopping network interface");
        }
        count
    }

    /// Ticks every interface.
    pub fn tick(&mut self) {
        for interface in &mut self.interfaces {
            interface.tick(&mut self.bandwidth);
        }
    }

    /// Sum of connection counts over all interfaces.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.interfaces.iter().map(|i| i.connection_count()).sum()
    }

    /// Pushes the server name to every interface.
    pub fn update_name(&mut self, name: &str) {
        if self.name != name {
            self.name = name.to_string();
        }
        for interface in &mut self.interfaces {
            interface.set_name(&self.name);
        }
    }

    /// Closes every interface with `reason`.
    pub fn close_all(&mut self, reason: &str) {
        for interface in &mut self.interfaces {
            interface.close(reason);
        }
    }

    /// Number of registered interfaces.
    #[must_use]
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Bandwidth stats.
    #[must_use]
    pub const fn bandwidth(&self) -> &BandwidthTracker {
        &self.bandwidth
    }

    /// Mutable bandwidth stats.
    pub fn bandwidth_mut(&mut self) -> &mut BandwidthTracker {
        &mut self.bandwidth
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("interfaces", &self.interfaces.len())
            .field("name", &self.name)
            .field("bandwidth", &self.bandwidth)
            .finish()
    }
}
