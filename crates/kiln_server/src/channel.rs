//! Named broadcast channels.
//!
//! A channel is just a set of subscribers under a string id. Channels are
//! created by the first subscribe and disappear with the last unsubscribe.

use std::collections::{HashMap, HashSet};

use crate::session::SessionId;

/// Channel for operators: warnings, command feedback, admin notices.
pub const BROADCAST_CHANNEL_ADMINISTRATIVE: &str = "kiln.broadcast.admin";

/// Channel for everyone: chat and server announcements.
pub const BROADCAST_CHANNEL_USERS: &str = "kiln.broadcast.user";

/// Something that can receive broadcast messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subscriber {
    /// The server console.
    Console,
    /// A connected session.
    Session(SessionId),
}

/// Subscriber sets keyed by channel id.
#[derive(Debug, Default)]
pub struct BroadcastChannels {
    channels: HashMap<String, HashSet<Subscriber>>,
}

impl BroadcastChannels {
    /// Creates an empty channel table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to `channel`. Returns false if already subscribed.
    pub fn subscribe(&mut self, channel: &str, subscriber: Subscriber) -> bool {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(subscriber)
    }

    /// Unsubscribes from `channel`. Returns false if not subscribed.
    pub fn unsubscribe(&mut self, channel: &str, subscriber: Subscriber) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&subscriber);
        if members.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Removes `subscriber` from every channel. Returns how many it left.
    pub fn unsubscribe_from_all(&mut self, subscriber: Subscriber) -> usize {
        let mut left = 0;
        self.channels.retain(|_, members| {
            if members.remove(&subscriber) {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    /// Subscribers of `channel`, sorted. Empty for an unknown channel.
    #[must_use]
    pub fn subscribers(&self, channel: &str) -> Vec<Subscriber> {
        let mut members: Vec<Subscriber> = self
            .channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Returns true if `subscriber` is in `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str, subscriber: Subscriber) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains(&subscriber))
    }

    /// Number of subscribers in `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, HashSet::len)
    }

    /// Number of non-empty channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if `channel` has at least one subscriber.
    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: Subscriber = Subscriber::Session(SessionId(1));
    const BOB: Subscriber = Subscriber::Session(SessionId(2));

    #[test]
    fn test_double_subscribe_is_idempotent() {
        let mut channels = BroadcastChannels::new();
        assert!(channels.subscribe(BROADCAST_CHANNEL_USERS, ALICE));
        assert!(!channels.subscribe(BROADCAST_CHANNEL_USERS, ALICE));
        assert_eq!(channels.subscriber_count(BROADCAST_CHANNEL_USERS), 1);
    }

    #[test]
    fn test_unsubscribe_non_member_is_noop() {
        let mut channels = BroadcastChannels::new();
        channels.subscribe(BROADCAST_CHANNEL_USERS, ALICE);

        assert!(!channels.unsubscribe(BROADCAST_CHANNEL_USERS, BOB));
        assert!(!channels.unsubscribe("no.such.channel", BOB));
        assert_eq!(channels.subscribers(BROADCAST_CHANNEL_USERS), vec![ALICE]);
    }

    #[test]
    fn test_empty_channel_removed() {
        let mut channels = BroadcastChannels::new();
        channels.subscribe("kiln.test", ALICE);
        assert!(channels.has_channel("kiln.test"));

        assert!(channels.unsubscribe("kiln.test", ALICE));
        assert!(!channels.has_channel("kiln.test"));
        assert_eq!(channels.channel_count(), 0);
    }

    #[test]
    fn test_unsubscribe_from_all() {
        let mut channels = BroadcastChannels::new();
        channels.subscribe(BROADCAST_CHANNEL_USERS, ALICE);
        channels.subscribe(BROADCAST_CHANNEL_ADMINISTRATIVE, ALICE);
        channels.subscribe(BROADCAST_CHANNEL_USERS, Subscriber::Console);

        assert_eq!(channels.unsubscribe_from_all(ALICE), 2);
        assert!(!channels.has_channel(BROADCAST_CHANNEL_ADMINISTRATIVE));
        assert_eq!(
            channels.subscribers(BROADCAST_CHANNEL_USERS),
            vec![Subscriber::Console]
        );
        assert!(!channels.is_subscribed(BROADCAST_CHANNEL_USERS, ALICE));
    }
}
