//! The connection hub.
//!
//! All connection, subscription and presence state lives in [`HubState`],
//! which is owned by a single task. Everything else talks to that task
//! through the cloneable [`Hub`] handle, so the state itself needs no locks.
//! The one exception is the set of online users, which is mirrored into a
//! read-mostly snapshot for synchronous queries.
//!
//! Delivery to clients never waits: a frame is offered to each recipient's
//! bounded outbound queue with `try_send`, and a recipient whose queue is
//! full or closed is removed as if it had disconnected.

use async_trait::async_trait;
use bytes::Bytes;
use cord_protocol::{codec, Envelope, PresenceStatus};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionId, Delivery, Lifecycle, UserId};
use crate::presence::{PresenceRegistry, PresenceTransition};
use crate::subscription::{validate_channel_id, ChannelId, SubscriptionIndex};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("Hub is not running")]
    Closed,

    /// Only connections that have not been registered before may register.
    #[error("Connection {0} is not in the connecting state")]
    NotConnecting(ConnectionId),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command queue feeding the hub task.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Number of registered connections.
    pub connections: usize,
    /// Number of channels with at least one subscriber.
    pub channels: usize,
    /// Number of users with at least one connection.
    pub online_users: usize,
    /// Connections dropped because their outbound queue was full.
    pub slow_consumer_drops: u64,
}

/// Side effect run when a user's last connection goes away.
#[async_trait]
pub trait PresenceHook: Send + Sync + 'static {
    async fn on_user_offline(&self, user_id: UserId);
}

/// Synchronous hub core.
///
/// Each mutating operation returns the users that went offline as a result,
/// so the caller can run the offline hook outside the state.
#[derive(Debug)]
pub struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    presence: PresenceRegistry,
    subscriptions: SubscriptionIndex,
    online: Arc<RwLock<HashSet<UserId>>>,
    slow_consumer_drops: u64,
}

impl HubState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            presence: PresenceRegistry::new(),
            subscriptions: SubscriptionIndex::new(),
            online: Arc::new(RwLock::new(HashSet::new())),
            slow_consumer_drops: 0,
        }
    }

    /// Shared view of the online users, updated on every presence edge.
    #[must_use]
    pub fn online_snapshot(&self) -> Arc<RwLock<HashSet<UserId>>> {
        Arc::clone(&self.online)
    }

    /// Register a connection and activate it.
    ///
    /// When this is the user's first connection, every client, including the
    /// new one, is told the user is online.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotConnecting`] if the connection has already been
    /// activated or closed.
    pub fn register(&mut self, connection: Connection) -> Result<Vec<UserId>, HubError> {
        let id = connection.id();
        if !connection
            .lifecycle()
            .transition(Lifecycle::Connecting, Lifecycle::Active)
        {
            return Err(HubError::NotConnecting(id));
        }

        let user_id = connection.user_id();
        self.connections.insert(id, connection);
        debug!(connection = %id, user = %user_id, total = self.connections.len(), "Registered connection");

        if self.presence.add(user_id, id) == PresenceTransition::CameOnline {
            self.online.write().insert(user_id);
            let failed = self.announce(user_id, PresenceStatus::Online);
            return Ok(self.evict(failed));
        }
        Ok(Vec::new())
    }

    /// Remove a connection. Unknown connections are ignored.
    pub fn unregister(&mut self, connection_id: ConnectionId) -> Vec<UserId> {
        self.evict(vec![connection_id])
    }

    /// Subscribe a registered connection to a channel.
    ///
    /// Returns `true` if a new subscription was recorded.
    pub fn subscribe(&mut self, connection_id: ConnectionId, channel: &str) -> bool {
        if let Err(reason) = validate_channel_id(channel) {
            warn!(connection = %connection_id, reason, "Ignoring subscribe to invalid channel");
            return false;
        }
        if !self.connections.contains_key(&connection_id) {
            debug!(connection = %connection_id, channel = %channel, "Ignoring subscribe from unregistered connection");
            return false;
        }
        self.subscriptions.subscribe(connection_id, channel)
    }

    /// Unsubscribe a connection from a channel.
    pub fn unsubscribe(&mut self, connection_id: ConnectionId, channel: &str) -> bool {
        self.subscriptions.unsubscribe(connection_id, channel)
    }

    /// Deliver an event to every subscriber of a channel.
    pub fn broadcast(&mut self, channel: &str, envelope: &Envelope) -> Vec<UserId> {
        let Some(frame) = encode(envelope) else {
            return Vec::new();
        };
        let targets = self.subscriptions.subscribers(channel);
        trace!(channel = %channel, event = %envelope.event, recipients = targets.len(), "Broadcast");
        let failed = self.fan_out(targets, &frame);
        self.evict(failed)
    }

    /// Deliver an event to every registered connection.
    pub fn broadcast_all(&mut self, envelope: &Envelope) -> Vec<UserId> {
        let Some(frame) = encode(envelope) else {
            return Vec::new();
        };
        let targets: Vec<ConnectionId> = self.connections.keys().copied().collect();
        trace!(event = %envelope.event, recipients = targets.len(), "Broadcast to all");
        let failed = self.fan_out(targets, &frame);
        self.evict(failed)
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            channels: self.subscriptions.channel_count(),
            online_users: self.presence.online_count(),
            slow_consumer_drops: self.slow_consumer_drops,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscriptions.subscriber_count(channel)
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    #[must_use]
    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.presence.is_online(user_id)
    }

    /// Offer a frame to each target; returns the targets that could not take it.
    fn fan_out(&mut self, targets: Vec<ConnectionId>, frame: &Bytes) -> Vec<ConnectionId> {
        let mut failed = Vec::new();
        for id in targets {
            let Some(conn) = self.connections.get(&id) else {
                continue;
            };
            match conn.try_send(frame.clone()) {
                Delivery::Queued => {}
                Delivery::Full => {
                    self.slow_consumer_drops += 1;
                    warn!(connection = %id, user = %conn.user_id(), "Outbound queue full, dropping slow consumer");
                    failed.push(id);
                }
                Delivery::Closed => {
                    debug!(connection = %id, "Outbound queue closed, dropping connection");
                    failed.push(id);
                }
            }
        }
        failed
    }

    /// Tell every connection about a user's presence change.
    fn announce(&mut self, user_id: UserId, status: PresenceStatus) -> Vec<ConnectionId> {
        let Some(frame) = encode(&Envelope::presence_update(user_id, status)) else {
            return Vec::new();
        };
        let everyone: Vec<ConnectionId> = self.connections.keys().copied().collect();
        self.fan_out(everyone, &frame)
    }

    /// Fully unregister connections.
    ///
    /// An offline announcement can itself overflow other queues, so removals
    /// are processed as a worklist until nothing else fails.
    fn evict(&mut self, ids: Vec<ConnectionId>) -> Vec<UserId> {
        let mut pending: VecDeque<Connection> = self.detach(ids).collect();
        let mut offline = Vec::new();

        while let Some(conn) = pending.pop_front() {
            let (id, user_id) = (conn.id(), conn.user_id());
            conn.lifecycle().advance(Lifecycle::Closing);
            self.subscriptions.remove_connection(id);
            debug!(connection = %id, user = %user_id, total = self.connections.len(), "Unregistered connection");

            if self.presence.remove(user_id, id) == PresenceTransition::WentOffline {
                self.online.write().remove(&user_id);
                offline.push(user_id);
                let failed = self.announce(user_id, PresenceStatus::Offline);
                pending.extend(self.detach(failed));
            }
            // Dropping the last strong sender closes the outbound queue.
            drop(conn);
        }
        offline
    }

    fn detach(&mut self, ids: Vec<ConnectionId>) -> impl Iterator<Item = Connection> + '_ {
        ids.into_iter().filter_map(|id| self.connections.remove(&id))
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(envelope: &Envelope) -> Option<Bytes> {
    match codec::encode(envelope) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "Failed to serialize event, skipping broadcast");
            None
        }
    }
}

enum HubCommand {
    Register {
        connection: Connection,
        ack: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister(ConnectionId),
    Subscribe {
        connection_id: ConnectionId,
        channel: ChannelId,
    },
    Unsubscribe {
        connection_id: ConnectionId,
        channel: ChannelId,
    },
    Broadcast {
        channel: ChannelId,
        envelope: Envelope,
    },
    BroadcastAll(Envelope),
    Stats(oneshot::Sender<HubStats>),
    SubscriberCount {
        channel: ChannelId,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the hub task.
///
/// The task stops once every handle has been dropped; any connections still
/// registered at that point have their outbound queues closed.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    online: Arc<RwLock<HashSet<UserId>>>,
}

impl Hub {
    /// Start the hub task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        Self::start(config, None)
    }

    /// Start the hub task with a hook run whenever a user goes offline.
    #[must_use]
    pub fn spawn_with_hook(config: HubConfig, hook: Arc<dyn PresenceHook>) -> (Self, JoinHandle<()>) {
        Self::start(config, Some(hook))
    }

    fn start(config: HubConfig, hook: Option<Arc<dyn PresenceHook>>) -> (Self, JoinHandle<()>) {
        let state = HubState::new();
        let online = state.online_snapshot();
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        info!("Starting hub with config: {:?}", config);
        let handle = tokio::spawn(run(state, rx, hook));
        (Self { commands, online }, handle)
    }

    /// Register a connection, resolving once the hub has processed it.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped or the connection was already
    /// registered once.
    pub async fn register(&self, connection: Connection) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Register { connection, ack }).await?;
        done.await.map_err(|_| HubError::Closed)?
    }

    /// Unregister a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(connection_id)).await
    }

    /// Subscribe a connection to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        channel: impl Into<ChannelId>,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Subscribe {
            connection_id,
            channel: channel.into(),
        })
        .await
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        channel: impl Into<ChannelId>,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Unsubscribe {
            connection_id,
            channel: channel.into(),
        })
        .await
    }

    /// Queue an event for every subscriber of a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn broadcast(
        &self,
        channel: impl Into<ChannelId>,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast {
            channel: channel.into(),
            envelope,
        })
        .await
    }

    /// Queue an event for every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn broadcast_all(&self, envelope: Envelope) -> Result<(), HubError> {
        self.send(HubCommand::BroadcastAll(envelope)).await
    }

    /// Current statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of connections subscribed to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn subscriber_count(&self, channel: impl Into<ChannelId>) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::SubscriberCount {
            channel: channel.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Whether a user has at least one registered connection.
    #[must_use]
    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.online.read().contains(user_id)
    }

    /// All users with at least one registered connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.online.read().iter().copied().collect()
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}

async fn run(
    mut state: HubState,
    mut commands: mpsc::Receiver<HubCommand>,
    hook: Option<Arc<dyn PresenceHook>>,
) {
    while let Some(command) = commands.recv().await {
        let offline = match command {
            HubCommand::Register { connection, ack } => match state.register(connection) {
                Ok(offline) => {
                    let _ = ack.send(Ok(()));
                    offline
                }
                Err(e) => {
                    let _ = ack.send(Err(e));
                    Vec::new()
                }
            },
            HubCommand::Unregister(id) => state.unregister(id),
            HubCommand::Subscribe {
                connection_id,
                channel,
            } => {
                state.subscribe(connection_id, &channel);
                Vec::new()
            }
            HubCommand::Unsubscribe {
                connection_id,
                channel,
            } => {
                state.unsubscribe(connection_id, &channel);
                Vec::new()
            }
            HubCommand::Broadcast { channel, envelope } => state.broadcast(&channel, &envelope),
            HubCommand::BroadcastAll(envelope) => state.broadcast_all(&envelope),
            HubCommand::Stats(reply) => {
                let _ = reply.send(state.stats());
                Vec::new()
            }
            HubCommand::SubscriberCount { channel, reply } => {
                let _ = reply.send(state.subscriber_count(&channel));
                Vec::new()
            }
        };

        if let Some(hook) = &hook {
            for user_id in offline {
                let hook = Arc::clone(hook);
                tokio::spawn(async move { hook.on_user_offline(user_id).await });
            }
        }
    }
    info!(connections = state.stats().connections, "Hub stopped");
}
