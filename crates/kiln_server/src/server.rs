//! # Server Context
//!
//! [`Server`] owns everything the tick thread touches: sessions, channels,
//! events, the worker pool, network interfaces and the world hooks. It is
//! built once by [`ServerBuilder`] and handed around explicitly.
//!
//! ## Startup and Shutdown
//!
//! ```text
//! ServerBuilder::build
//!   validate config ─> pool ─> request notifier ─> console ─> Open report
//! ServerRuntime::run
//!   TickScheduler::run(&mut server)   until "stop" or ServerRequest::Shutdown
//! Server::force_shutdown
//!   Close report ─> close sessions ─> close interfaces ─> unload world
//!   ─> drop handlers ─> pool shutdown ─> console ─> unregister interfaces
//! ```

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Instant;

use kiln_core::{CompressBatchPromise, Compressor, ShutdownReport, SleeperHandler, WorkerPool};

use crate::api::ApiRegistry;
use crate::broadcast::{self, BatchCompression};
use crate::channel::{
    BroadcastChannels, Subscriber, BROADCAST_CHANNEL_ADMINISTRATIVE, BROADCAST_CHANNEL_USERS,
};
use crate::config::ServerConfig;
use crate::console::{request_channel, ConsoleReader, RequestQueue, RequestSender, ServerRequest};
use crate::error::{ServerError, ServerResult};
use crate::event::{Cancellable, CommandEvent, EventBus, QueryInfo, QueryRegenerateEvent};
use crate::memory::MemoryManager;
use crate::network::{Network, NetworkInterface};
use crate::protocol::{ClientboundPacket, PacketBatch};
use crate::scheduler::JobScheduler;
use crate::session::{Session, SessionId, SessionRegistry};
use crate::tick::{Clock, RunHandle, SystemClock, TickHandler, TickScheduler, TickStats};
use crate::usage::{LogUsageSink, UsageKind, UsageReport, UsageSink, UsageTracker};
use crate::world::{NoopWorld, WorldHooks};

/// Reason given to a session whose batch could not be decoded.
pub const INVALID_BATCH_REASON: &str = "Invalid packet batch";

const HELP_TEXT: &str = "Commands: help, status, stop";

enum ConsoleInput {
    Disabled,
    Stdin,
    Reader(Box<dyn BufRead + Send>),
}

/// Tick-rate figures cached at the last status window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickSnapshot {
    /// Tick number of the snapshot.
    pub tick: u64,
    /// Rolling TPS average.
    pub tps_average: f64,
    /// Rolling load in percent.
    pub load_percent: f64,
}

/// Configures and builds a [`ServerRuntime`].
pub struct ServerBuilder {
    config: ServerConfig,
    world: Box<dyn WorldHooks>,
    interfaces: Vec<Box<dyn NetworkInterface>>,
    console: ConsoleInput,
    usage_sinks: Vec<(Arc<dyn UsageSink>, String)>,
}

impl ServerBuilder {
    /// Starts from `config`. The console follows `console.enabled`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let console = if config.console.enabled {
            ConsoleInput::Stdin
        } else {
            ConsoleInput::Disabled
        };
        Self {
            config,
            world: Box::new(NoopWorld),
            interfaces: Vec::new(),
            console,
            usage_sinks: Vec::new(),
        }
    }

    /// Drives `world` from the tick loop.
    #[must_use]
    pub fn world(mut self, world: impl WorldHooks + 'static) -> Self {
        self.world = Box::new(world);
        self
    }

    /// Registers a network interface.
    #[must_use]
    pub fn interface(mut self, interface: impl NetworkInterface + 'static) -> Self {
        self.interfaces.push(Box::new(interface));
        self
    }

    /// Reads console commands from `input` instead of standard input.
    #[must_use]
    pub fn console_input(mut self, input: impl BufRead + Send + 'static) -> Self {
        self.console = ConsoleInput::Reader(Box::new(input));
        self
    }

    /// Runs without a console reader.
    #[must_use]
    pub fn without_console(mut self) -> Self {
        self.console = ConsoleInput::Disabled;
        self
    }

    /// Overrides the usage report sink on behalf of `owner`.
    ///
    /// Only one override may be registered; a second one fails the build
    /// with [`ApiError::AlreadyOverridden`](crate::ApiError::AlreadyOverridden).
    #[must_use]
    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>, owner: impl Into<String>) -> Self {
        self.usage_sinks.push((sink, owner.into()));
        self
    }

    /// Builds the server on the real clock.
    pub fn build(self) -> ServerResult<ServerRuntime> {
        self.build_with_clock(SystemClock)
    }

    /// Builds the server with its tick scheduler on `clock`.
    pub fn build_with_clock<C: Clock>(self, clock: C) -> ServerResult<ServerRuntime<C>> {
        let Self {
            mut config,
            world,
            interfaces,
            console,
            usage_sinks,
        } = self;
        config.validate()?;

        let pool = WorkerPool::new(config.pool_config())?;
        let compression = BatchCompression::new(config.compressor(), config.network.async_compression);

        let mut sleeper: SleeperHandler<Server> = SleeperHandler::new();
        let notifier = sleeper.add_notifier(Server::process_requests);
        let (request_sender, requests) = request_channel(notifier);

        let scheduler =
            TickScheduler::with_clock(clock, config.tick.ticks_per_second, config.tick.overload_tps);

        // Registration can fail; it runs before the console thread starts.
        let mut apis = ApiRegistry::new();
        apis.provide_default::<dyn UsageSink>(Arc::new(LogUsageSink))?;
        for (sink, owner) in usage_sinks {
            apis.provide::<dyn UsageSink>(sink, owner)?;
        }

        let console = match console {
            ConsoleInput::Disabled => None,
            ConsoleInput::Stdin => Some(ConsoleReader::stdin(request_sender.clone())),
            ConsoleInput::Reader(input) => Some(ConsoleReader::spawn(input, request_sender.clone())),
        }
        .transpose()
        .map_err(|source| ServerError::Thread {
            what: "console reader",
            source,
        })?;

        let mut channels = BroadcastChannels::new();
        channels.subscribe(BROADCAST_CHANNEL_ADMINISTRATIVE, Subscriber::Console);
        channels.subscribe(BROADCAST_CHANNEL_USERS, Subscriber::Console);

        let mut network = Network::new(config.server.name.clone());
        for interface in interfaces {
            network.register_interface(interface);
        }

        let usage = UsageTracker::new(
            config.anonymous_statistics.enabled,
            config.anonymous_statistics.interval_ticks,
        );
        let memory = MemoryManager::new(config.global_soft_limit(), config.memory.check_rate_ticks);
        let query = QueryInfo {
            server_name: config.server.name.clone(),
            online: 0,
            max_sessions: config.server.max_sessions,
            tps_average: f64::from(config.tick.ticks_per_second),
            load_percent: 0.0,
            extra: Vec::new(),
        };

        let mut server = Server {
            sessions: SessionRegistry::new(),
            channels,
            events: EventBus::new(),
            compression,
            pool,
            network,
            jobs: JobScheduler::new(),
            world,
            apis,
            usage,
            memory,
            requests,
            request_sender,
            console,
            run_handle: scheduler.handle(),
            query,
            status_line: String::new(),
            snapshot: TickSnapshot {
                tick: 0,
                tps_average: f64::from(config.tick.ticks_per_second),
                load_percent: 0.0,
            },
            started_at: Instant::now(),
            has_stopped: false,
            config,
        };

        server.send_usage(UsageKind::Open);
        tracing::info!(
            name = %server.config.server.name,
            workers = server.pool.size(),
            interfaces = server.network.interface_count(),
            "Server started"
        );

        Ok(ServerRuntime {
            server,
            scheduler,
            sleeper,
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("interfaces", &self.interfaces.len())
            .finish_non_exhaustive()
    }
}

/// A built server with its tick loop.
pub struct ServerRuntime<C: Clock = SystemClock> {
    /// The server context.
    pub server: Server,
    /// Its tick scheduler.
    pub scheduler: TickScheduler<C>,
    /// Notifier callbacks serviced between ticks.
    pub sleeper: SleeperHandler<Server>,
}

impl<C: Clock> ServerRuntime<C> {
    /// Runs the tick loop until the server is asked to stop.
    pub fn run(&mut self) {
        self.scheduler.run(&mut self.server, &mut self.sleeper);
    }

    /// Handle for queueing requests from other threads.
    #[must_use]
    pub fn request_sender(&self) -> RequestSender {
        self.server.request_sender()
    }
}

impl<C: Clock> std::fmt::Debug for ServerRuntime<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("server", &self.server)
            .field("tick", &self.scheduler.tick_count())
            .finish_non_exhaustive()
    }
}

/// Everything the tick thread owns.
pub struct Server {
    config: ServerConfig,
    sessions: SessionRegistry,
    channels: BroadcastChannels,
    events: EventBus,
    pool: WorkerPool,
    compression: BatchCompression,
    network: Network,
    jobs: JobScheduler,
    world: Box<dyn WorldHooks>,
    apis: ApiRegistry,
    usage: UsageTracker,
    memory: MemoryManager,
    requests: RequestQueue,
    request_sender: RequestSender,
    console: Option<ConsoleReader>,
    run_handle: RunHandle,
    query: QueryInfo,
    status_line: String,
    snapshot: TickSnapshot,
    started_at: Instant,
    has_stopped: bool,
}

impl Server {
    /// Registers a connected session and subscribes it to the users channel.
    pub fn connect_session(&mut self, session: Session) -> ServerResult<()> {
        let id = session.id();
        let name = session.display_name().to_string();
        self.sessions.add(session)?;
        self.channels.subscribe(BROADCAST_CHANNEL_USERS, Subscriber::Session(id));
        self.usage.record_session(id);
        tracing::info!(session = %id, %name, "Session connected");
        Ok(())
    }

    /// Closes a session with `reason` and forgets it.
    pub fn disconnect_session(&mut self, id: SessionId, reason: &str) -> ServerResult<()> {
        let Some(session) = self.sessions.get_mut(id) else {
            return Err(ServerError::UnknownSession(id));
        };
        session.disconnect(reason);
        self.sessions.remove(id);
        self.channels.unsubscribe_from_all(Subscriber::Session(id));
        tracing::info!(session = %id, reason, "Session disconnected");
        Ok(())
    }

    /// Sends `packets` to the connected sessions among `targets`.
    ///
    /// See [`broadcast::broadcast_packets`].
    pub fn broadcast_packets(
        &mut self,
        targets: &[SessionId],
        packets: &[ClientboundPacket],
    ) -> ServerResult<bool> {
        broadcast::broadcast_packets(&self.sessions, &mut self.events, targets, packets)
    }

    /// Compresses `batch` inline or on a worker.
    ///
    /// See [`BatchCompression::prepare`].
    pub fn prepare_batch(
        &mut self,
        batch: PacketBatch,
        sync: Option<bool>,
    ) -> ServerResult<CompressBatchPromise> {
        self.compression.prepare(&mut self.pool, batch, sync)
    }

    /// Delivers `message` to `recipients`, or to the users channel.
    ///
    /// Returns the number of recipients reached.
    pub fn broadcast_message(&self, message: &str, recipients: Option<&[Subscriber]>) -> usize {
        let recipients = match recipients {
            Some(recipients) => recipients.to_vec(),
            None => self.channels.subscribers(BROADCAST_CHANNEL_USERS),
        };
        recipients
            .iter()
            .filter(|recipient| self.deliver(**recipient, message))
            .count()
    }

    /// Delivers `message` to every subscriber of `channel`.
    pub fn broadcast_to_channel(&self, message: &str, channel: &str) -> usize {
        let recipients = self.channels.subscribers(channel);
        self.broadcast_message(message, Some(&recipients))
    }

    fn deliver(&self, recipient: Subscriber, message: &str) -> bool {
        match recipient {
            Subscriber::Console => {
                tracing::info!(target: "kiln::console", "{message}");
                true
            }
            Subscriber::Session(id) => match self.sessions.get(id) {
                Some(session) if session.is_connected() => {
                    session.send_message(message);
                    true
                }
                _ => false,
            },
        }
    }

    /// Decompresses and splits a batch received from `id`.
    ///
    /// Corrupt input disconnects the session and yields `Ok(None)`.
    pub fn handle_incoming_batch(
        &mut self,
        id: SessionId,
        payload: &[u8],
    ) -> ServerResult<Option<Vec<Vec<u8>>>> {
        if !self.sessions.contains(id) {
            return Err(ServerError::UnknownSession(id));
        }
        self.network.bandwidth_mut().add_received(payload.len() as u64);

        let decoded = self
            .compression
            .compressor()
            .decompress(payload)
            .and_then(|buffer| PacketBatch::from_buffer(buffer).decode());

        match decoded {
            Ok(packets) => Ok(Some(packets)),
            Err(error) => {
                tracing::warn!(session = %id, %error, "Dropping session after bad batch");
                self.disconnect_session(id, INVALID_BATCH_REASON)?;
                Ok(None)
            }
        }
    }

    /// Runs a command line from `sender`.
    ///
    /// Returns false if a handler cancelled it or the command is unknown.
    pub fn dispatch_command(&mut self, sender: Subscriber, line: &str) -> bool {
        let mut event = CommandEvent::new(sender, line.trim());
        self.events.call(&mut event);
        if event.is_cancelled() {
            return false;
        }

        let command = event.command().to_string();
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match name.as_str() {
            "stop" => {
                self.deliver(sender, "Stopping the server");
                self.shutdown();
                true
            }
            "status" => {
                let status = self.status_text();
                self.deliver(sender, &status);
                true
            }
            "help" | "?" => {
                self.deliver(sender, HELP_TEXT);
                true
            }
            _ => {
                self.deliver(sender, &format!("Unknown command: {command}. Try help."));
                false
            }
        }
    }

    /// Drains requests queued by other threads. Runs on the tick thread.
    pub fn process_requests(&mut self) {
        for request in self.requests.drain() {
            match request {
                ServerRequest::Command(line) => {
                    self.dispatch_command(Subscriber::Console, &line);
                }
                ServerRequest::Shutdown => self.shutdown(),
            }
        }
    }

    /// Asks the tick loop to exit after the current tick.
    pub fn shutdown(&mut self) {
        if self.run_handle.is_running() {
            tracing::info!("Stopping the server");
        }
        self.run_handle.stop();
    }

    /// Tears everything down. Safe to call more than once.
    pub fn force_shutdown(&mut self) -> ShutdownReport {
        if self.has_stopped {
            return ShutdownReport::default();
        }
        tracing::info!("Shutting down");

        if self.config.console.title_tick {
            write_title("");
        }
        self.send_usage(UsageKind::Close);
        self.has_stopped = true;
        self.shutdown();

        let reason = self.config.server.shutdown_message.clone();
        for id in self.sessions.ids() {
            if let Some(session) = self.sessions.get_mut(id) {
                session.disconnect(&reason);
            }
            self.sessions.remove(id);
            self.channels.unsubscribe_from_all(Subscriber::Session(id));
        }
        self.network.close_all(&reason);

        tracing::debug!("Unloading world");
        self.world.unload_all();

        self.events.unregister_all();
        self.jobs.cancel_all();

        tracing::debug!("Stopping async workers");
        let report = self.pool.shutdown(self.config.pool_shutdown_timeout());
        if !report.is_clean() {
            tracing::warn!(abandoned = report.abandoned, "Some workers did not stop in time");
        }

        if let Some(console) = self.console.as_mut() {
            console.shutdown();
        }
        self.network.unregister_all();

        tracing::info!("Server stopped");
        report
    }

    fn send_usage(&mut self, kind: UsageKind) {
        if !self.usage.is_enabled() {
            return;
        }
        let Some((sink, _)) = self.apis.get::<dyn UsageSink>() else {
            return;
        };
        let report = UsageReport {
            kind,
            server_name: self.config.server.name.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            unique_sessions: self.usage.take_unique(),
            online: self.sessions.len(),
            max_sessions: self.config.server.max_sessions,
            tps_average: self.snapshot.tps_average,
            load_percent: self.snapshot.load_percent,
            worker_count: self.pool.size(),
        };
        sink.submit(&report);
    }

    /// Sessions with an open connection that have not finished joining.
    #[must_use]
    pub fn connecting_count(&self) -> usize {
        self.network.connection_count().saturating_sub(self.sessions.len())
    }

    /// Builds the status line shown in the terminal title.
    #[must_use]
    pub fn status_text(&self) -> String {
        let connecting = self.connecting_count();
        let connecting = if connecting > 0 {
            format!(" (+{connecting} connecting)")
        } else {
            String::new()
        };
        let bandwidth = self.network.bandwidth();
        format!(
            "{} | Online {}/{}{} | U {:.2} D {:.2} kB/s | TPS {:.2} | Load {:.2}%",
            self.config.server.name,
            self.sessions.len(),
            self.config.server.max_sessions,
            connecting,
            bandwidth.send().average_bytes() / 1024.0,
            bandwidth.receive().average_bytes() / 1024.0,
            self.snapshot.tps_average,
            self.snapshot.load_percent,
        )
    }

    /// The status line from the last status window.
    #[must_use]
    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    /// Query info from the last status window.
    #[must_use]
    pub const fn query_info(&self) -> &QueryInfo {
        &self.query
    }

    /// Tick figures from the last status window.
    #[must_use]
    pub const fn tick_snapshot(&self) -> TickSnapshot {
        self.snapshot
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registered sessions.
    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Broadcast channels.
    #[must_use]
    pub const fn channels(&self) -> &BroadcastChannels {
        &self.channels
    }

    /// Mutable broadcast channels.
    pub fn channels_mut(&mut self) -> &mut BroadcastChannels {
        &mut self.channels
    }

    /// Event handlers.
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// The worker pool.
    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Mutable worker pool.
    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    /// Network interfaces and bandwidth.
    #[must_use]
    pub const fn network(&self) -> &Network {
        &self.network
    }

    /// Mutable network.
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    /// Tick-keyed jobs.
    pub fn jobs_mut(&mut self) -> &mut JobScheduler {
        &mut self.jobs
    }

    /// Capability registry.
    pub fn apis_mut(&mut self) -> &mut ApiRegistry {
        &mut self.apis
    }

    /// Handle for queueing requests from other threads.
    #[must_use]
    pub fn request_sender(&self) -> RequestSender {
        self.request_sender.clone()
    }

    /// Returns true until a stop is requested.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run_handle.is_running()
    }

    /// Returns true once [`Server::force_shutdown`] has run.
    #[must_use]
    pub const fn has_stopped(&self) -> bool {
        self.has_stopped
    }
}

impl TickHandler for Server {
    fn run_scheduled_jobs(&mut self, tick: u64) {
        self.jobs.heartbeat(tick);
    }

    fn collect_async_results(&mut self) {
        self.pool.collect_tasks();
    }

    fn tick_world(&mut self, tick: u64) {
        self.world.tick(tick);
    }

    fn tick_network(&mut self, _tick: u64) {
        self.network.tick();
    }

    fn on_status_window(&mut self, tick: u64, stats: &TickStats) {
        self.snapshot = TickSnapshot {
            tick,
            tps_average: stats.tps_average(),
            load_percent: stats.load_percent(),
        };

        self.status_line = self.status_text();
        if self.config.console.title_tick {
            write_title(&self.status_line);
        } else {
            tracing::debug!(status = %self.status_line, "Status");
        }

        let mut event = QueryRegenerateEvent {
            info: QueryInfo {
                server_name: self.config.server.name.clone(),
                online: self.sessions.len(),
                max_sessions: self.config.server.max_sessions,
                tps_average: self.snapshot.tps_average,
                load_percent: self.snapshot.load_percent,
                extra: Vec::new(),
            },
        };
        self.events.call(&mut event);
        self.query = event.info;

        self.network.update_name(&self.config.server.name);
        self.network.bandwidth_mut().rotate_history();
    }

    fn on_usage_tick(&mut self, _tick: u64) {
        if self.usage.tick() {
            self.send_usage(UsageKind::Status);
        }
    }

    fn on_maintenance(&mut self, _tick: u64) {
        self.world.clear_cache();
    }

    fn check_memory(&mut self, tick: u64) {
        if self.memory.check(tick, self.pool.memory_usage()) {
            self.broadcast_to_channel(
                "Worker memory is above the soft limit",
                BROADCAST_CHANNEL_ADMINISTRATIVE,
            );
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.config.server.name)
            .field("sessions", &self.sessions.len())
            .field("workers", &self.pool.size())
            .field("has_stopped", &self.has_stopped)
            .finish_non_exhaustive()
    }
}

fn write_title(title: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "\x1b]0;{title}\x07");
    let _ = stdout.flush();
}
