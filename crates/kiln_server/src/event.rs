//! # Typed Events
//!
//! Each event kind is its own struct with its own [`HandlerList`]. Handlers
//! run on the tick thread in registration order and receive `&mut E`, so they
//! can mutate or cancel; the caller inspects the event after the chain
//! returns.
//!
//! ```text
//! bus.call(&mut event)
//!     handler 0 (&mut event)
//!     handler 1 (&mut event)   <- may set_cancelled(true)
//!     ...
//! caller reads event.is_cancelled() / event.targets()
//! ```

use std::fmt;

use crate::protocol::ClientboundPacket;
use crate::session::SessionId;
use crate::channel::Subscriber;

/// An event kind dispatched through the [`EventBus`].
pub trait Event: Sized + 'static {
    /// Selects this event's handler list on the bus.
    fn handler_list(bus: &mut EventBus) -> &mut HandlerList<Self>;
}

/// Events whose default action can be suppressed.
pub trait Cancellable {
    /// Returns true if a handler cancelled the event.
    fn is_cancelled(&self) -> bool;

    /// Cancels or un-cancels the event.
    fn set_cancelled(&mut self, cancelled: bool);
}

type Handler<E> = Box<dyn FnMut(&mut E)>;

/// Ordered handlers for one event kind.
pub struct HandlerList<E> {
    handlers: Vec<Handler<E>>,
}

impl<E> HandlerList<E> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Appends a handler.
    pub fn register(&mut self, handler: impl FnMut(&mut E) + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Runs every handler in registration order.
    pub fn dispatch(&mut self, event: &mut E) {
        for handler in &mut self.handlers {
            handler(event);
        }
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Removes every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl<E> Default for HandlerList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for HandlerList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerList")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Handler lists for every event kind the server fires.
#[derive(Debug, Default)]
pub struct EventBus {
    packet_send: HandlerList<PacketSendEvent>,
    query_regenerate: HandlerList<QueryRegenerateEvent>,
    command: HandlerList<CommandEvent>,
}

impl EventBus {
    /// Creates a bus with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `E`.
    pub fn register<E: Event>(&mut self, handler: impl FnMut(&mut E) + 'static) {
        E::handler_list(self).register(handler);
    }

    /// Fires `event` through every handler registered for `E`.
    pub fn call<E: Event>(&mut self, event: &mut E) {
        E::handler_list(self).dispatch(event);
    }

    /// Removes every handler of every kind.
    pub fn unregister_all(&mut self) {
        self.packet_send.clear();
        self.query_regenerate.clear();
        self.command.clear();
    }
}

/// Fired before packets are handed to broadcasters.
///
/// Handlers may cancel the send or rewrite the target list.
#[derive(Debug)]
pub struct PacketSendEvent {
    targets: Vec<SessionId>,
    packets: Vec<ClientboundPacket>,
    cancelled: bool,
}

impl PacketSendEvent {
    /// Creates the event.
    #[must_use]
    pub fn new(targets: Vec<SessionId>, packets: Vec<ClientboundPacket>) -> Self {
        Self {
            targets,
            packets,
            cancelled: false,
        }
    }

    /// Sessions the packets will go to.
    #[must_use]
    pub fn targets(&self) -> &[SessionId] {
        &self.targets
    }

    /// Replaces the target list.
    pub fn set_targets(&mut self, targets: Vec<SessionId>) {
        self.targets = targets;
    }

    /// Packets being sent.
    #[must_use]
    pub fn packets(&self) -> &[ClientboundPacket] {
        &self.packets
    }

    /// Consumes the event, returning targets and packets.
    #[must_use]
    pub fn into_parts(self) -> (Vec<SessionId>, Vec<ClientboundPacket>) {
        (self.targets, self.packets)
    }
}

impl Cancellable for PacketSendEvent {
    fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn set_cancelled(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
    }
}

impl Event for PacketSendEvent {
    fn handler_list(bus: &mut EventBus) -> &mut HandlerList<Self> {
        &mut bus.packet_send
    }
}

/// Server description answered to status queries.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryInfo {
    /// Server name shown to clients.
    pub server_name: String,
    /// Sessions online.
    pub online: usize,
    /// Session cap.
    pub max_sessions: usize,
    /// Rolling TPS average.
    pub tps_average: f64,
    /// Rolling load average in percent.
    pub load_percent: f64,
    /// Free-form extra fields handlers may add.
    pub extra: Vec<(String, String)>,
}

/// Fired every status window before the query info is published.
#[derive(Debug)]
pub struct QueryRegenerateEvent {
    /// The info to publish; handlers may rewrite it.
    pub info: QueryInfo,
}

impl Event for QueryRegenerateEvent {
    fn handler_list(bus: &mut EventBus) -> &mut HandlerList<Self> {
        &mut bus.query_regenerate
    }
}

/// Fired before a command line is dispatched.
#[derive(Debug)]
pub struct CommandEvent {
    sender: Subscriber,
    command: String,
    cancelled: bool,
}

impl CommandEvent {
    /// Creates the event.
    #[must_use]
    pub fn new(sender: Subscriber, command: impl Into<String>) -> Self {
        Self {
            sender,
            command: command.into(),
            cancelled: false,
        }
    }

    /// Who issued the command.
    #[must_use]
    pub const fn sender(&self) -> Subscriber {
        self.sender
    }

    /// The command line.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Rewrites the command line.
    pub fn set_command(&mut self, command: impl Into<String>) {
        self.command = command.into();
    }
}

impl Cancellable for CommandEvent {
    fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn set_cancelled(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
    }
}

impl Event for CommandEvent {
    fn handler_list(bus: &mut EventBus) -> &mut HandlerList<Self> {
        &mut bus.command
    }
}
