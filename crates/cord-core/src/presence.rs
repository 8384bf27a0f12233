//! Per-user presence tracking.
//!
//! A user is online while at least one of their connections is registered.
//! The registry reports only the edges: the first connection of an offline
//! user and the last connection of an online user.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::connection::{ConnectionId, UserId};

/// Presence edge produced by adding or removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    CameOnline,
    WentOffline,
    Unchanged,
}

/// Presence tracker keyed by user.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: HashMap<UserId, HashSet<ConnectionId>>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection for a user.
    pub fn add(&mut self, user_id: UserId, connection_id: ConnectionId) -> PresenceTransition {
        let connections = self.users.entry(user_id).or_default();
        let was_offline = connections.is_empty();
        if !connections.insert(connection_id) {
            return PresenceTransition::Unchanged;
        }

        if was_offline {
            debug!(user = %user_id, "Presence: user online");
            PresenceTransition::CameOnline
        } else {
            PresenceTransition::Unchanged
        }
    }

    /// Forget a connection for a user.
    pub fn remove(&mut self, user_id: UserId, connection_id: ConnectionId) -> PresenceTransition {
        let Some(connections) = self.users.get_mut(&user_id) else {
            return PresenceTransition::Unchanged;
        };
        if !connections.remove(&connection_id) {
            return PresenceTransition::Unchanged;
        }

        if connections.is_empty() {
            self.users.remove(&user_id);
            debug!(user = %user_id, "Presence: user offline");
            PresenceTransition::WentOffline
        } else {
            PresenceTransition::Unchanged
        }
    }

    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    /// Number of live connections a user has.
    #[must_use]
    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.users.get(user_id).map_or(0, HashSet::len)
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.users.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_first_and_last_connection_are_the_only_edges() {
        let mut presence = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (a, b) = (ConnectionId::generate(), ConnectionId::generate());

        assert_eq!(presence.add(user, a), PresenceTransition::CameOnline);
        assert_eq!(presence.add(user, b), PresenceTransition::Unchanged);
        assert_eq!(presence.connection_count(&user), 2);

        assert_eq!(presence.remove(user, a), PresenceTransition::Unchanged);
        assert!(presence.is_online(&user));
        assert_eq!(presence.remove(user, b), PresenceTransition::WentOffline);
        assert!(!presence.is_online(&user));
        assert_eq!(presence.online_count(), 0);
    }

    #[test]
    fn test_repeated_add_and_remove_are_noops() {
        let mut presence = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let conn = ConnectionId::generate();

        assert_eq!(presence.add(user, conn), PresenceTransition::CameOnline);
        assert_eq!(presence.add(user, conn), PresenceTransition::Unchanged);
        assert_eq!(presence.remove(user, conn), PresenceTransition::WentOffline);
        assert_eq!(presence.remove(user, conn), PresenceTransition::Unchanged);
        assert_eq!(
            presence.remove(Uuid::new_v4(), conn),
            PresenceTransition::Unchanged
        );
    }

    #[test]
    fn test_online_users() {
        let mut presence = PresenceRegistry::new();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        presence.add(u1, ConnectionId::generate());
        presence.add(u2, ConnectionId::generate());

        let mut online = presence.online_users();
        online.sort();
        let mut expected = vec![u1, u2];
        expected.sort();
        assert_eq!(online, expected);
    }
}
