//! # Sessions
//!
//! A session is one connected client as the tick thread sees it. Transport
//! details live behind the session's [`PacketBroadcaster`], which the session
//! only references weakly: the network layer owns broadcasters, the registry
//! owns sessions.
//!
//! ## Lifecycle
//!
//! ```text
//! handshake (network) ──> SessionRegistry::add ──> ... ──> SessionRegistry::remove
//!                          notifies everyone                 notifies the rest
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{ServerError, ServerResult};
use crate::protocol::ClientboundPacket;

/// Stable unique id of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, packets flow.
    #[default]
    Connected,
    /// Closed. No further packets are sent.
    Disconnected,
}

/// Sends packets to a group of sessions that share a transport.
///
/// Implementations may batch and compress once for the whole group.
pub trait PacketBroadcaster: Send + Sync {
    /// Sends `packets`, in order, to every session in `recipients`.
    fn broadcast_packets(&self, recipients: &[SessionId], packets: &[ClientboundPacket]);
}

/// Per-client delivery of non-packet notifications.
///
/// Every method has a no-op default.
pub trait SessionListener: Send + Sync {
    /// Another session joined.
    fn on_session_added(&self, _session: SessionId, _name: &str) {}

    /// Another session left.
    fn on_session_removed(&self, _session: SessionId, _name: &str) {}

    /// A chat or system message addressed to this client.
    fn on_message(&self, _message: &str) {}

    /// This session was closed by the server.
    fn on_disconnect(&self, _reason: &str) {}
}

/// One connected client.
pub struct Session {
    id: SessionId,
    display_name: String,
    state: ConnectionState,
    broadcaster: Weak<dyn PacketBroadcaster>,
    listener: Option<Arc<dyn SessionListener>>,
}

impl Session {
    /// Creates a connected session delivered through `broadcaster`.
    #[must_use]
    pub fn new(
        id: SessionId,
        display_name: impl Into<String>,
        broadcaster: &Arc<dyn PacketBroadcaster>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            state: ConnectionState::Connected,
            broadcaster: Arc::downgrade(broadcaster),
            listener: None,
        }
    }

    /// Attaches a listener for roster and message notifications.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Returns the session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns true while packets may be sent.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Upgrades the broadcaster reference. `None` once the transport is gone.
    #[must_use]
    pub fn broadcaster(&self) -> Option<Arc<dyn PacketBroadcaster>> {
        self.broadcaster.upgrade()
    }

    /// Delivers a message through the listener, if any.
    pub fn send_message(&self, message: &str) {
        if let Some(listener) = &self.listener {
            listener.on_message(message);
        }
    }

    /// Marks the session closed and tells the client why.
    ///
    /// Returns false if it was already disconnected.
    pub fn disconnect(&mut self, reason: &str) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Disconnected;
        if let Some(listener) = &self.listener {
            listener.on_disconnect(reason);
        }
        true
    }

    fn notify_added(&self, other: &Session) {
        if let Some(listener) = &self.listener {
            listener.on_session_added(other.id, &other.display_name);
        }
    }

    fn notify_removed(&self, other: &Session) {
        if let Some(listener) = &self.listener {
            listener.on_session_removed(other.id, &other.display_name);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("state", &self.state)
            .field("has_listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

/// All sessions known to the tick thread, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and notifies every existing one.
    pub fn add(&mut self, session: Session) -> ServerResult<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(ServerError::DuplicateSession(session.id));
        }
        for existing in self.sessions.values() {
            existing.notify_added(&session);
        }
        tracing::debug!(session = %session.id, name = %session.display_name, "Session registered");
        self.sessions.insert(session.id, session);
        Ok(())
    }

    /// Unregisters a session and notifies the remaining ones.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        for remaining in self.sessions.values() {
            remaining.notify_removed(&session);
        }
        tracing::debug!(session = %id, "Session unregistered");
        Some(session)
    }

    /// Looks up a session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Looks up a session mutably.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Iterates sessions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Ids of all registered sessions, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Keeps the ids in `targets` that are registered and connected.
    ///
    /// Order is preserved; duplicates are dropped.
    #[must_use]
    pub fn connected(&self, targets: &[SessionId]) -> Vec<SessionId> {
        let mut seen = std::collections::HashSet::with_capacity(targets.len());
        targets
            .iter()
            .copied()
            .filter(|id| self.get(*id).is_some_and(Session::is_connected))
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct NullBroadcaster;

    impl PacketBroadcaster for NullBroadcaster {
        fn broadcast_packets(&self, _recipients: &[SessionId], _packets: &[ClientboundPacket]) {}
    }

    #[derive(Default)]
    struct RosterLog {
        events: Mutex<Vec<String>>,
    }

    impl SessionListener for RosterLog {
        fn on_session_added(&self, session: SessionId, name: &str) {
            self.events.lock().push(format!("+{session} {name}"));
        }

        fn on_session_removed(&self, session: SessionId, name: &str) {
            self.events.lock().push(format!("-{session} {name}"));
        }

        fn on_disconnect(&self, reason: &str) {
            self.events.lock().push(format!("bye: {reason}"));
        }
    }

    fn broadcaster() -> Arc<dyn PacketBroadcaster> {
        Arc::new(NullBroadcaster)
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let net = broadcaster();
        let mut registry = SessionRegistry::new();
        registry.add(Session::new(SessionId(1), "alice", &net)).unwrap();

        let err = registry.add(Session::new(SessionId(1), "mallory", &net)).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateSession(SessionId(1))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(SessionId(1)).unwrap().display_name(), "alice");
    }

    #[test]
    fn test_roster_notifications() {
        let net = broadcaster();
        let alice_log = Arc::new(RosterLog::default());
        let bob_log = Arc::new(RosterLog::default());
        let mut registry = SessionRegistry::new();

        registry
            .add(Session::new(SessionId(1), "alice", &net).with_listener(alice_log.clone()))
            .unwrap();
        registry
            .add(Session::new(SessionId(2), "bob", &net).with_listener(bob_log.clone()))
            .unwrap();
        registry.remove(SessionId(1)).unwrap();

        // Alice saw Bob join; Bob joined after Alice so only sees her leave.
        assert_eq!(*alice_log.events.lock(), vec!["+#2 bob".to_string()]);
        assert_eq!(*bob_log.events.lock(), vec!["-#1 alice".to_string()]);
    }

    #[test]
    fn test_connected_filter() {
        let net = broadcaster();
        let mut registry = SessionRegistry::new();
        for id in 1..=3 {
            registry.add(Session::new(SessionId(id), format!("p{id}"), &net)).unwrap();
        }
        assert!(registry.get_mut(SessionId(2)).unwrap().disconnect("kicked"));

        let connected = registry.connected(&[
            SessionId(3),
            SessionId(2),
            SessionId(9),
            SessionId(1),
            SessionId(3),
        ]);
        assert_eq!(connected, vec![SessionId(3), SessionId(1)]);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let net = broadcaster();
        let log = Arc::new(RosterLog::default());
        let mut session = Session::new(SessionId(5), "eve", &net).with_listener(log.clone());

        assert!(session.disconnect("timeout"));
        assert!(!session.disconnect("timeout"));
        assert!(!session.is_connected());
        assert_eq!(*log.events.lock(), vec!["bye: timeout".to_string()]);
    }

    #[test]
    fn test_broadcaster_is_weak() {
        let net = broadcaster();
        let session = Session::new(SessionId(1), "alice", &net);
        assert!(session.broadcaster().is_some());

        drop(net);
        assert!(session.broadcaster().is_none());
    }
}
