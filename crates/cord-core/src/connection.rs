//! Live client connections and their lifecycle.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifier of an authenticated user.
pub type UserId = Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// Who owns a connection, as established by token validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
}

impl UserIdentity {
    #[must_use]
    pub fn new(user_id: UserId, username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            display_name: display_name.into(),
        }
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Connecting,
            1 => Lifecycle::Active,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// Shared, lock-free lifecycle cell.
///
/// The hub and the connection's pumps each hold a handle.
#[derive(Debug, Clone)]
pub struct LifecycleHandle(Arc<AtomicU8>);

impl LifecycleHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Lifecycle::Connecting as u8)))
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from exactly `from` to `to`.
    ///
    /// Returns `false` if the current state was not `from`.
    pub fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        from < to
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Move forward to `to` from whatever state precedes it.
    ///
    /// Returns `false` if the connection is already at or past `to`.
    pub fn advance(&self, to: Lifecycle) -> bool {
        let target = to as u8;
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < target).then_some(target)
            })
            .is_ok()
    }
}

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The outbound queue is at capacity.
    Full,
    /// The write side has gone away.
    Closed,
}

/// A live client connection as owned by the hub.
///
/// Holds the only strong sender of the connection's outbound queue, so
/// dropping it closes the queue and ends the connection's write loop.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: UserIdentity,
    outbound: mpsc::Sender<Bytes>,
    lifecycle: LifecycleHandle,
}

impl Connection {
    /// Create a connection with a bounded outbound queue.
    ///
    /// Returns the connection together with the receiving end of its queue,
    /// which belongs to the write loop.
    #[must_use]
    pub fn new(identity: UserIdentity, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: ConnectionId::generate(),
            identity,
            outbound,
            lifecycle: LifecycleHandle::new(),
        };
        (conn, rx)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleHandle {
        &self.lifecycle
    }

    /// A sender that does not keep the outbound queue open.
    ///
    /// The read loop uses it to answer pings without outliving the hub's
    /// ownership of the connection.
    #[must_use]
    pub fn weak_sender(&self) -> mpsc::WeakSender<Bytes> {
        self.outbound.downgrade()
    }

    /// Enqueue a frame without waiting.
    pub fn try_send(&self, frame: Bytes) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> UserIdentity {
        UserIdentity::new(Uuid::new_v4(), "alice", "Alice")
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn_"));
    }

    #[test]
    fn test_lifecycle_only_moves_forward() {
        let (conn, _rx) = Connection::new(identity(), 4);
        let lc = conn.lifecycle();
        assert_eq!(lc.get(), Lifecycle::Connecting);

        assert!(lc.transition(Lifecycle::Connecting, Lifecycle::Active));
        assert!(!lc.transition(Lifecycle::Connecting, Lifecycle::Active));
        assert!(lc.advance(Lifecycle::Closed));
        assert!(!lc.advance(Lifecycle::Closing));
        assert_eq!(lc.get(), Lifecycle::Closed);
    }

    #[test]
    fn test_try_send_reports_full_and_closed() {
        let (conn, mut rx) = Connection::new(identity(), 1);
        assert_eq!(conn.try_send(Bytes::from_static(b"a")), Delivery::Queued);
        assert_eq!(conn.try_send(Bytes::from_static(b"b")), Delivery::Full);

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        rx.close();
        assert_eq!(conn.try_send(Bytes::from_static(b"c")), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_dropping_connection_closes_queue() {
        let (conn, mut rx) = Connection::new(identity(), 4);
        let weak = conn.weak_sender();

        if let Some(tx) = weak.upgrade() {
            tx.send(Bytes::from_static(b"pong")).await.unwrap();
        }
        drop(conn);

        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"pong")));
        assert_eq!(rx.recv().await, None);
        assert!(weak.upgrade().is_none());
    }
}
