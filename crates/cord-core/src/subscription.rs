//! Channel subscription index.
//!
//! Maps channel ids to subscribed connections and back, so that a
//! disconnecting connection can be removed from every channel it joined
//! without scanning all channels.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::connection::ConnectionId;

/// Maximum channel id length.
pub const MAX_CHANNEL_ID_LENGTH: usize = 256;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel id.
///
/// # Errors
///
/// Returns an error message if the channel id is invalid.
pub fn validate_channel_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Channel id cannot be empty");
    }
    if id.len() > MAX_CHANNEL_ID_LENGTH {
        return Err("Channel id too long");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel id contains invalid characters");
    }
    Ok(())
}

/// Two-way channel/connection index.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    channels: HashMap<ChannelId, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<ChannelId>>,
}

impl SubscriptionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a channel.
    ///
    /// Returns `true` if the subscription is new.
    pub fn subscribe(&mut self, connection_id: ConnectionId, channel: &str) -> bool {
        let added = self
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(connection_id);
        if added {
            self.by_connection
                .entry(connection_id)
                .or_default()
                .insert(channel.to_string());
            debug!(channel = %channel, connection = %connection_id, "Subscribed");
        }
        added
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `true` if the connection was subscribed. The channel entry is
    /// dropped once its last subscriber leaves.
    pub fn unsubscribe(&mut self, connection_id: ConnectionId, channel: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(members) => members.remove(&connection_id),
            None => false,
        };
        if !removed {
            return false;
        }

        self.drop_channel_if_empty(channel);
        if let Some(joined) = self.by_connection.get_mut(&connection_id) {
            joined.remove(channel);
            if joined.is_empty() {
                self.by_connection.remove(&connection_id);
            }
        }
        debug!(channel = %channel, connection = %connection_id, "Unsubscribed");
        true
    }

    /// Remove a connection from every channel it joined.
    ///
    /// Returns the number of subscriptions removed.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> usize {
        let Some(joined) = self.by_connection.remove(&connection_id) else {
            return 0;
        };
        for channel in &joined {
            if let Some(members) = self.channels.get_mut(channel) {
                members.remove(&connection_id);
            }
            self.drop_channel_if_empty(channel);
        }
        debug!(connection = %connection_id, channels = joined.len(), "Unsubscribed from all channels");
        joined.len()
    }

    fn drop_channel_if_empty(&mut self, channel: &str) {
        if self.channels.get(channel).is_some_and(HashSet::is_empty) {
            self.channels.remove(channel);
            debug!(channel = %channel, "Deleted empty channel");
        }
    }

    /// Connections currently subscribed to a channel.
    #[must_use]
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, HashSet::len)
    }

    #[must_use]
    pub fn is_subscribed(&self, connection_id: ConnectionId, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|members| members.contains(&connection_id))
    }

    #[must_use]
    pub fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channels a connection has joined.
    #[must_use]
    pub fn connection_channels(&self, connection_id: ConnectionId) -> Vec<ChannelId> {
        self.by_connection
            .get(&connection_id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }
}
