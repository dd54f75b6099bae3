//! # KILN Server - The Tick Thread
//!
//! Authoritative game server core: one tick thread owns all simulation and
//! session state, and hands CPU-heavy batch compression to the
//! [`kiln_core`] worker pool.
//!
//! ## Architecture
//!
//! - **Sessions**: registry of connected clients, each delivered through a
//!   shared [`PacketBroadcaster`]
//! - **Pipeline**: [`Server::broadcast_packets`] groups recipients per
//!   transport; [`Server::prepare_batch`] compresses inline or on a worker
//! - **Tick loop**: [`TickScheduler`] at 20 Hz with drift correction and
//!   rolling TPS/load statistics
//! - **Ambient**: typed events, broadcast channels, job scheduler, console,
//!   usage reports, memory checks and a shutdown watchdog
//!
//! ## Threading Model
//!
//! ```text
//! TICK THREAD                         WORKERS (kiln_core)
//!   |                                     |
//!   |--- CompressBatchTask -------------->|
//!   |                                     | <- compress
//!   |<-- completion (collect_tasks) ------|
//!   |    promise settles here             |
//!
//! CONSOLE / OTHER THREADS
//!   |--- ServerRequest + wake_up_sleeper --> drained between ticks
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use kiln_server::{ServerBuilder, ServerConfig};
//!
//! let config = ServerConfig::load("kiln.toml")?;
//! let mut runtime = ServerBuilder::new(config).build()?;
//! runtime.run();                       // Blocks until "stop"
//! runtime.server.force_shutdown();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod api;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod console;
pub mod error;
pub mod event;
pub mod memory;
pub mod network;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod tick;
pub mod usage;
pub mod watchdog;
pub mod world;

// Re-exports for convenience
pub use api::ApiRegistry;
pub use broadcast::{broadcast_packets, group_by_broadcaster, BatchCompression, BroadcastGroup};
pub use channel::{
    BroadcastChannels, Subscriber, BROADCAST_CHANNEL_ADMINISTRATIVE, BROADCAST_CHANNEL_USERS,
};
pub use config::{CompressionAlgorithm, ServerConfig, WorkerCount};
pub use console::{request_channel, ConsoleReader, RequestQueue, RequestSender, ServerRequest};
pub use error::{ApiError, ConfigError, ServerError, ServerResult};
pub use event::{
    Cancellable, CommandEvent, Event, EventBus, HandlerList, PacketSendEvent, QueryInfo,
    QueryRegenerateEvent,
};
pub use memory::MemoryManager;
pub use network::{BandwidthStats, BandwidthTracker, Network, NetworkInterface};
pub use protocol::{ClientboundPacket, PacketBatch};
pub use scheduler::{JobControl, JobHandle, JobScheduler};
pub use server::{Server, ServerBuilder, ServerRuntime, TickSnapshot};
pub use session::{
    ConnectionState, PacketBroadcaster, Session, SessionId, SessionListener, SessionRegistry,
};
pub use tick::{
    Clock, ManualClock, RunHandle, SchedulerState, SystemClock, TickHandler, TickOutcome,
    TickScheduler, TickStats,
};
pub use usage::{LogUsageSink, UsageKind, UsageReport, UsageSink, UsageTracker};
pub use watchdog::ShutdownWatchdog;
pub use world::{NoopWorld, WorldHooks};

/// Default tick rate (ticks per second).
pub const TICK_RATE: u32 = config::DEFAULT_TICKS_PER_SECOND;
