//! Per-connection read and write pumps.
//!
//! A session registers a [`Connection`] with the hub, then runs two loops
//! until either one stops:
//!
//! - the **read pump** decodes client events and turns them into hub
//!   commands, and enforces the read deadline;
//! - the **write pump** drains the connection's outbound queue to the socket
//!   and sends liveness pings.
//!
//! Whichever loop stops first ends the session, and the connection is
//! unregistered exactly once.

use bytes::Bytes;
use cord_core::{Connection, ConnectionId, Hub, HubError, Lifecycle, UserIdentity};
use cord_protocol::{codec, ClientEvent, Envelope, ProtocolError, MAX_MESSAGE_SIZE};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::traits::{FrameSink, FrameStream, TransportError, WireMessage};

/// Session timing and sizing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the write pump pings the client.
    pub ping_interval: Duration,
    /// How long the read pump waits for any inbound message.
    pub pong_wait: Duration,
    /// Deadline for a single socket write.
    pub write_wait: Duration,
    /// Largest accepted inbound message, in bytes.
    pub max_message_size: usize,
    /// Capacity of the connection's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::with_pong_wait(Duration::from_secs(60))
    }
}

impl SessionConfig {
    /// Defaults with the ping interval derived from `pong_wait` (nine tenths).
    #[must_use]
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            ping_interval: pong_wait * 9 / 10,
            pong_wait,
            write_wait: Duration::from_secs(10),
            max_message_size: MAX_MESSAGE_SIZE,
            outbound_capacity: 256,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the socket.
    ClientClosed,
    /// Nothing arrived within the read deadline.
    ReadTimeout,
    /// The socket reported a read error.
    ReadFailed,
    /// The client sent a message over the size limit.
    MessageTooLarge,
    /// The hub closed the outbound queue.
    QueueClosed,
    /// A write failed or missed its deadline.
    WriteFailed,
    /// A liveness ping could not be sent.
    PingFailed,
    /// The hub refused or is not running.
    HubUnavailable,
}

enum First {
    Reader(SessionEnd),
    Writer(SessionEnd),
}

/// Serve one authenticated client until the connection ends.
pub async fn run_session<S, R>(
    hub: Hub,
    identity: UserIdentity,
    mut sink: S,
    stream: R,
    config: SessionConfig,
) -> SessionEnd
where
    S: FrameSink,
    R: FrameStream,
{
    let (connection, outbound) = Connection::new(identity.clone(), config.outbound_capacity);
    let id = connection.id();
    let lifecycle = connection.lifecycle().clone();
    let replies = connection.weak_sender();

    if let Err(e) = hub.register(connection).await {
        warn!(connection = %id, user = %identity.user_id, error = %e, "Failed to register connection");
        let _ = sink.close().await;
        return SessionEnd::HubUnavailable;
    }
    debug!(connection = %id, user = %identity.user_id, "Session started");

    let reader = read_pump(&hub, id, &identity, stream, replies, &config);
    let writer = write_pump(id, sink, outbound, &config);
    tokio::pin!(reader);
    tokio::pin!(writer);

    let first = tokio::select! {
        end = &mut reader => First::Reader(end),
        end = &mut writer => First::Writer(end),
    };

    lifecycle.advance(Lifecycle::Closing);
    let end = match first {
        First::Reader(end) => {
            unregister(&hub, id).await;
            // The hub drops its sender on unregister, so the writer flushes
            // what is queued, sends a close frame and stops.
            let _ = (&mut writer).await;
            end
        }
        First::Writer(end) => {
            unregister(&hub, id).await;
            end
        }
    };
    lifecycle.advance(Lifecycle::Closed);

    debug!(connection = %id, user = %identity.user_id, reason = ?end, "Session ended");
    end
}

async fn unregister(hub: &Hub, id: ConnectionId) {
    if let Err(e) = hub.unregister(id).await {
        debug!(connection = %id, error = %e, "Unregister after hub shutdown");
    }
}

async fn read_pump<R: FrameStream>(
    hub: &Hub,
    id: ConnectionId,
    identity: &UserIdentity,
    mut stream: R,
    replies: mpsc::WeakSender<Bytes>,
    config: &SessionConfig,
) -> SessionEnd {
    loop {
        // Every inbound message, control frames included, restarts the deadline.
        let message = match timeout(config.pong_wait, stream.recv()).await {
            Err(_) => {
                debug!(connection = %id, "Read deadline expired");
                return SessionEnd::ReadTimeout;
            }
            Ok(Err(e)) => {
                debug!(connection = %id, error = %e, "Read failed");
                return SessionEnd::ReadFailed;
            }
            Ok(Ok(None)) | Ok(Ok(Some(WireMessage::Close))) => {
                return SessionEnd::ClientClosed;
            }
            Ok(Ok(Some(message))) => message,
        };

        let data: &[u8] = match &message {
            WireMessage::Text(text) => text.as_bytes(),
            WireMessage::SharedText(data) | WireMessage::Binary(data) => &data[..],
            WireMessage::Ping(_) | WireMessage::Pong(_) | WireMessage::Close => continue,
        };

        let event = match codec::decode_client_within(data, config.max_message_size) {
            Ok(event) => event,
            Err(ProtocolError::MessageTooLarge { size, limit }) => {
                warn!(connection = %id, size, limit, "Inbound message too large, closing");
                return SessionEnd::MessageTooLarge;
            }
            Err(e) => {
                debug!(connection = %id, error = %e, "Skipping undecodable message");
                continue;
            }
        };

        trace!(connection = %id, event = %event.name(), "Inbound event");
        if let Err(e) = dispatch(hub, id, identity, &replies, event).await {
            debug!(connection = %id, error = %e, "Hub unavailable");
            return SessionEnd::HubUnavailable;
        }
    }
}

async fn dispatch(
    hub: &Hub,
    id: ConnectionId,
    identity: &UserIdentity,
    replies: &mpsc::WeakSender<Bytes>,
    event: ClientEvent,
) -> Result<(), HubError> {
    match event {
        ClientEvent::Ping => {
            let Some(tx) = replies.upgrade() else {
                return Ok(());
            };
            match codec::encode(&Envelope::pong()) {
                Ok(frame) => {
                    if tx.try_send(frame).is_err() {
                        debug!(connection = %id, "Outbound queue unavailable, pong dropped");
                    }
                }
                Err(e) => warn!(connection = %id, error = %e, "Failed to encode pong"),
            }
        }
        ClientEvent::SubscribeChannel { channel_id } => hub.subscribe(id, channel_id).await?,
        ClientEvent::UnsubscribeChannel { channel_id } => hub.unsubscribe(id, channel_id).await?,
        ClientEvent::TypingStart { channel_id } => {
            let envelope =
                Envelope::typing_start(identity.user_id, &identity.username, &channel_id);
            hub.broadcast(channel_id, envelope).await?;
        }
        ClientEvent::Signal {
            name,
            channel_id,
            payload,
        } => {
            let envelope = Envelope::signal(&name, payload, identity.user_id, &identity.username);
            hub.broadcast(channel_id, envelope).await?;
        }
        ClientEvent::Unrecognized { name } => {
            debug!(connection = %id, event = %name, "Ignoring unknown event");
        }
    }
    Ok(())
}

async fn write_pump<S: FrameSink>(
    id: ConnectionId,
    mut sink: S,
    mut outbound: mpsc::Receiver<Bytes>,
    config: &SessionConfig,
) -> SessionEnd {
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    if let Ok(Err(e)) = timeout(config.write_wait, sink.close()).await {
                        trace!(connection = %id, error = %e, "Close after queue shutdown failed");
                    }
                    return SessionEnd::QueueClosed;
                };
                if let Err(e) = std::str::from_utf8(&frame) {
                    warn!(connection = %id, error = %e, "Dropping non-UTF-8 outbound frame");
                    continue;
                }
                if let Err(e) = write(&mut sink, WireMessage::SharedText(frame), config.write_wait).await {
                    debug!(connection = %id, error = %e, "Write failed");
                    return SessionEnd::WriteFailed;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write(&mut sink, WireMessage::Ping(Bytes::new()), config.write_wait).await {
                    debug!(connection = %id, error = %e, "Ping failed");
                    return SessionEnd::PingFailed;
                }
            }
        }
    }
}

async fn write<S: FrameSink>(
    sink: &mut S,
    message: WireMessage,
    deadline: Duration,
) -> Result<(), TransportError> {
    timeout(deadline, sink.send(message))
        .await
        .map_err(|_| TransportError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{self, MemoryPeer};
    use cord_core::HubConfig;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn identity(name: &str) -> UserIdentity {
        UserIdentity::new(Uuid::new_v4(), name, name.to_uppercase())
    }

    fn start(
        hub: &Hub,
        who: &UserIdentity,
        config: SessionConfig,
    ) -> (MemoryPeer, tokio::task::JoinHandle<SessionEnd>) {
        let (sink, stream, peer) = memory::pair(64);
        let task = tokio::spawn(run_session(hub.clone(), who.clone(), sink, stream, config));
        (peer, task)
    }

    /// Next text message from the server, skipping transport pings.
    async fn next_event(peer: &mut MemoryPeer) -> Envelope {
        loop {
            match peer.recv().await {
                Some(WireMessage::SharedText(data)) => return serde_json::from_slice(&data).unwrap(),
                Some(WireMessage::Ping(_)) => continue,
                other => panic!("Expected text message, got {:?}", other),
            }
        }
    }

    /// Next event that is not a presence update.
    async fn next_non_presence(peer: &mut MemoryPeer) -> Envelope {
        loop {
            let env = next_event(peer).await;
            if env.event != "presence_update" {
                return env;
            }
        }
    }

    async fn wait_for_subscribers(hub: &Hub, channel: &str, n: usize) {
        for _ in 0..200 {
            if hub.subscriber_count(channel).await.unwrap() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("channel {channel} never reached {n} subscribers");
    }

    fn assert_elapsed(started: Instant, secs: u64) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs) && elapsed < Duration::from_secs(secs + 1),
            "expected ~{secs}s, got {elapsed:?}"
        );
    }

    async fn wait_until_registered(hub: &Hub, who: &UserIdentity) {
        for _ in 0..200 {
            if hub.is_user_online(&who.user_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("user never came online");
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let alice = identity("alice");
        let (mut peer, _session) = start(&hub, &alice, SessionConfig::default());

        peer.send_text(r#"{"event":"ping"}"#).await.unwrap();
        let pong = next_non_presence(&mut peer).await;
        assert_eq!(pong.event, "pong");
        assert_eq!(pong.data, Value::Null);
    }

    #[tokio::test]
    async fn test_typing_start_reaches_channel_subscribers() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (alice, bob) = (identity("alice"), identity("bob"));
        let (mut a, _sa) = start(&hub, &alice, SessionConfig::default());
        let (b, _sb) = start(&hub, &bob, SessionConfig::default());

        a.send_text(r#"{"event":"subscribe_channel","data":{"channelId":"c1"}}"#)
            .await
            .unwrap();
        wait_for_subscribers(&hub, "c1", 1).await;

        b.send_text(r#"{"event":"typing_start","data":{"channelId":"c1"}}"#)
            .await
            .unwrap();

        let typing = next_non_presence(&mut a).await;
        assert_eq!(typing.event, "typing_start");
        assert_eq!(
            typing.data,
            json!({"userId": bob.user_id.to_string(), "username": "bob", "channelId": "c1"})
        );
    }

    #[tokio::test]
    async fn test_signal_is_relayed_with_sender() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (alice, bob) = (identity("alice"), identity("bob"));
        let (mut a, _sa) = start(&hub, &alice, SessionConfig::default());
        let (b, _sb) = start(&hub, &bob, SessionConfig::default());

        a.send_text(r#"{"event":"subscribe_channel","data":{"channelId":"voice"}}"#)
            .await
            .unwrap();
        wait_for_subscribers(&hub, "voice", 1).await;

        b.send_text(r#"{"event":"rtc:offer","data":{"channelId":"voice","sdp":"v=0"}}"#)
            .await
            .unwrap();

        let offer = next_non_presence(&mut a).await;
        assert_eq!(offer.event, "rtc:offer");
        assert_eq!(offer.data["sdp"], json!("v=0"));
        assert_eq!(offer.data["senderId"], json!(bob.user_id.to_string()));
        assert_eq!(offer.data["senderUsername"], json!("bob"));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages_are_skipped() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let alice = identity("alice");
        let (mut peer, _session) = start(&hub, &alice, SessionConfig::default());

        peer.send_text("not json").await.unwrap();
        peer.send_text(r#"{"event":"message_create","data":{}}"#).await.unwrap();
        peer.send_text(r#"{"event":"subscribe_channel","data":{}}"#).await.unwrap();
        peer.send_text(r#"{"event":"ping"}"#).await.unwrap();

        assert_eq!(next_non_presence(&mut peer).await.event, "pong");
        assert!(hub.is_user_online(&alice.user_id));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let alice = identity("alice");
        let (mut peer, _session) = start(&hub, &alice, SessionConfig::default());

        peer.send_text(r#"{"event":"subscribe_channel","data":{"channelId":"c"}}"#)
            .await
            .unwrap();
        wait_for_subscribers(&hub, "c", 1).await;
        peer.send_text(r#"{"event":"unsubscribe_channel","data":{"channelId":"c"}}"#)
            .await
            .unwrap();
        wait_for_subscribers(&hub, "c", 0).await;

        hub.broadcast("c", Envelope::new("message_create", json!({"id": 1})))
            .await
            .unwrap();
        peer.send_text(r#"{"event":"ping"}"#).await.unwrap();
        assert_eq!(next_non_presence(&mut peer).await.event, "pong");
    }

    #[tokio::test]
    async fn test_oversized_message_closes_connection() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let alice = identity("alice");
        let (mut peer, session) = start(&hub, &alice, SessionConfig::default());
        wait_until_registered(&hub, &alice).await;

        let padding = "x".repeat(MAX_MESSAGE_SIZE);
        peer.send_text(format!(
            r#"{{"event":"typing_start","data":{{"channelId":"{padding}"}}}}"#
        ))
        .await
        .unwrap();

        assert_eq!(session.await.unwrap(), SessionEnd::MessageTooLarge);
        hub.stats().await.unwrap();
        assert!(!hub.is_user_online(&alice.user_id));

        let mut saw_close = false;
        while let Some(message) = peer.recv().await {
            saw_close |= message == WireMessage::Close;
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_client_close_unregisters_once() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (alice, bob) = (identity("alice"), identity("bob"));
        let (mut observer, _so) = start(&hub, &bob, SessionConfig::default());
        wait_until_registered(&hub, &bob).await;
        let (peer, session) = start(&hub, &alice, SessionConfig::default());
        wait_until_registered(&hub, &alice).await;

        peer.send(WireMessage::Close).await.unwrap();
        assert_eq!(session.await.unwrap(), SessionEnd::ClientClosed);

        loop {
            let env = next_event(&mut observer).await;
            if env.data["userId"] == json!(alice.user_id.to_string())
                && env.data["status"] == json!("offline")
            {
                break;
            }
        }
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.online_users, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let alice = identity("alice");
        let (mut peer, session) = start(&hub, &alice, SessionConfig::default());
        let started = Instant::now();

        assert_eq!(next_event(&mut peer).await.event, "presence_update");
        // The write pump pings at nine tenths of the read deadline.
        assert_eq!(peer.recv().await, Some(WireMessage::Ping(Bytes::new())));
        assert_elapsed(started, 54);

        assert_eq!(peer.recv().await, Some(WireMessage::Close));
        assert_eq!(session.await.unwrap(), SessionEnd::ReadTimeout);
        assert_elapsed(started, 60);
        hub.stats().await.unwrap();
        assert!(!hub.is_user_online(&alice.user_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_read_deadline() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let alice = identity("alice");
        let (mut peer, session) = start(&hub, &alice, SessionConfig::default());
        let started = Instant::now();

        assert_eq!(next_event(&mut peer).await.event, "presence_update");
        assert_eq!(peer.recv().await, Some(WireMessage::Ping(Bytes::new())));
        peer.send(WireMessage::Pong(Bytes::new())).await.unwrap();

        // Still alive past the original deadline: the next ping arrives.
        assert_eq!(peer.recv().await, Some(WireMessage::Ping(Bytes::new())));
        assert_elapsed(started, 108);
        assert!(!session.is_finished());

        assert_eq!(peer.recv().await, Some(WireMessage::Close));
        assert_eq!(session.await.unwrap(), SessionEnd::ReadTimeout);
        assert_elapsed(started, 114);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_hits_write_deadline() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let alice = identity("alice");
        // Socket capacity of one: the online event fills it and nobody reads.
        let (sink, stream, peer) = memory::pair(1);
        let config = SessionConfig::default();
        let session = tokio::spawn(run_session(hub.clone(), alice.clone(), sink, stream, config));
        wait_until_registered(&hub, &alice).await;

        hub.broadcast_all(Envelope::new("message_create", json!({})))
            .await
            .unwrap();

        assert_eq!(session.await.unwrap(), SessionEnd::WriteFailed);
        hub.stats().await.unwrap();
        assert!(!hub.is_user_online(&alice.user_id));
        drop(peer);
    }

    #[tokio::test]
    async fn test_register_fails_when_hub_stopped() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        task.abort();
        let _ = task.await;

        let (sink, stream, mut peer) = memory::pair(4);
        let end = run_session(hub, identity("alice"), sink, stream, SessionConfig::default()).await;
        assert_eq!(end, SessionEnd::HubUnavailable);
        assert_eq!(peer.recv().await, Some(WireMessage::Close));
    }

    #[tokio::test]
    async fn test_outbound_frames_share_the_encoded_buffer() {
        let (sink, _stream, mut peer) = memory::pair(8);
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(async move {
            write_pump(ConnectionId::generate(), sink, rx, &SessionConfig::default()).await
        });

        let frame = Bytes::from_static(br#"{"event":"pong","data":null}"#);
        tx.send(frame.clone()).await.unwrap();
        match peer.recv().await {
            Some(WireMessage::SharedText(sent)) => assert_eq!(sent.as_ptr(), frame.as_ptr()),
            other => panic!("Expected shared text, got {:?}", other),
        }

        tx.send(Bytes::from_static(&[0xff, 0xfe])).await.unwrap();
        drop(tx);
        assert_eq!(peer.recv().await, Some(WireMessage::Close));
        assert_eq!(writer.await.unwrap(), SessionEnd::QueueClosed);
    }
}
