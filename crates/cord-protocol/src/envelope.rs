//! Event envelope and event kinds for the Cord protocol.
//!
//! The same `{event, data}` shape is used for client-originated and
//! server-originated messages. Clients may send only the events listed in
//! [`ClientEvent`]; anything else decodes to [`ClientEvent::Unrecognized`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::ProtocolError;

/// Event names used on the wire.
pub mod names {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SUBSCRIBE_CHANNEL: &str = "subscribe_channel";
    pub const UNSUBSCRIBE_CHANNEL: &str = "unsubscribe_channel";
    pub const TYPING_START: &str = "typing_start";
    pub const PRESENCE_UPDATE: &str = "presence_update";
    pub const MESSAGE_CREATE: &str = "message_create";
    pub const MESSAGE_UPDATE: &str = "message_update";
    pub const MESSAGE_DELETE: &str = "message_delete";
    /// Prefix shared by all call-signaling events (`rtc:offer`, `rtc:answer`, ...).
    pub const SIGNAL_PREFIX: &str = "rtc:";
}

/// A wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Opaque event payload.
    #[serde(default)]
    pub data: Value,
}

/// Online status carried by `presence_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Create an envelope whose payload is any serializable value.
    ///
    /// This is how request handlers wrap persisted entities, e.g. a stored
    /// message for `message_create`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn with_payload<T: Serialize>(
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    /// The `pong` reply to a client `ping`.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(names::PONG, Value::Null)
    }

    /// A `presence_update` for one user.
    #[must_use]
    pub fn presence_update(user_id: Uuid, status: PresenceStatus) -> Self {
        Self::new(
            names::PRESENCE_UPDATE,
            serde_json::json!({
                "userId": user_id,
                "status": status,
            }),
        )
    }

    /// A `typing_start` indicator for a channel.
    #[must_use]
    pub fn typing_start(user_id: Uuid, username: &str, channel_id: &str) -> Self {
        Self::new(
            names::TYPING_START,
            serde_json::json!({
                "userId": user_id,
                "username": username,
                "channelId": channel_id,
            }),
        )
    }

    /// A relayed call-signaling event.
    ///
    /// The client payload is passed through untouched apart from the sender
    /// identity, which always overwrites any `senderId`/`senderUsername` the
    /// client supplied.
    #[must_use]
    pub fn signal(name: &str, payload: Value, sender_id: Uuid, sender_username: &str) -> Self {
        let mut fields = match payload {
            Value::Object(fields) => fields,
            other => {
                let mut fields = Map::new();
                fields.insert("payload".to_string(), other);
                fields
            }
        };
        fields.insert("senderId".to_string(), Value::String(sender_id.to_string()));
        fields.insert(
            "senderUsername".to_string(),
            Value::String(sender_username.to_string()),
        );
        Self::new(name, Value::Object(fields))
    }
}

/// Payload of every channel-scoped client event.
#[derive(Debug, Deserialize)]
struct ChannelRef {
    #[serde(rename = "channelId")]
    channel_id: String,
}

/// A decoded client-originated event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Application-level keepalive; answered with `pong`.
    Ping,
    /// Start receiving broadcasts for a channel.
    SubscribeChannel { channel_id: String },
    /// Stop receiving broadcasts for a channel.
    UnsubscribeChannel { channel_id: String },
    /// The sender started typing in a channel.
    TypingStart { channel_id: String },
    /// Call-signaling message relayed to the channel as-is.
    Signal {
        name: String,
        channel_id: String,
        payload: Value,
    },
    /// Any event name the server does not handle.
    Unrecognized { name: String },
}

impl ClientEvent {
    /// Interpret an envelope as a client event.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] when a known event carries a
    /// payload without the fields it needs.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { event, data } = envelope;
        match event.as_str() {
            names::PING => Ok(ClientEvent::Ping),
            names::SUBSCRIBE_CHANNEL => Ok(ClientEvent::SubscribeChannel {
                channel_id: channel_ref(&event, data)?,
            }),
            names::UNSUBSCRIBE_CHANNEL => Ok(ClientEvent::UnsubscribeChannel {
                channel_id: channel_ref(&event, data)?,
            }),
            names::TYPING_START => Ok(ClientEvent::TypingStart {
                channel_id: channel_ref(&event, data)?,
            }),
            name if is_signal(name) => {
                let channel_id = channel_ref(&event, data.clone())?;
                Ok(ClientEvent::Signal {
                    name: event,
                    channel_id,
                    payload: data,
                })
            }
            _ => Ok(ClientEvent::Unrecognized { name: event }),
        }
    }

    /// The event name as it appeared on the wire.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            ClientEvent::Ping => names::PING,
            ClientEvent::SubscribeChannel { .. } => names::SUBSCRIBE_CHANNEL,
            ClientEvent::UnsubscribeChannel { .. } => names::UNSUBSCRIBE_CHANNEL,
            ClientEvent::TypingStart { .. } => names::TYPING_START,
            ClientEvent::Signal { name, .. } | ClientEvent::Unrecognized { name } => name,
        }
    }
}

/// Whether an event name belongs to the call-signaling family.
#[must_use]
pub fn is_signal(name: &str) -> bool {
    name.len() > names::SIGNAL_PREFIX.len() && name.starts_with(names::SIGNAL_PREFIX)
}

fn channel_ref(event: &str, data: Value) -> Result<String, ProtocolError> {
    serde_json::from_value::<ChannelRef>(data)
        .map(|r| r.channel_id)
        .map_err(|e| ProtocolError::InvalidPayload {
            event: event.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event: &str, data: Value) -> Envelope {
        Envelope::new(event, data)
    }

    #[test]
    fn test_known_events() {
        assert_eq!(
            ClientEvent::from_envelope(envelope("ping", Value::Null)).unwrap(),
            ClientEvent::Ping
        );
        assert_eq!(
            ClientEvent::from_envelope(envelope("typing_start", json!({"channelId": "c1"})))
                .unwrap(),
            ClientEvent::TypingStart {
                channel_id: "c1".to_string()
            }
        );
        assert_eq!(
            ClientEvent::from_envelope(envelope(
                "unsubscribe_channel",
                json!({"channelId": "c2"})
            ))
            .unwrap(),
            ClientEvent::UnsubscribeChannel {
                channel_id: "c2".to_string()
            }
        );
    }

    #[test]
    fn test_signal_event_keeps_payload() {
        let data = json!({"channelId": "voice", "targetId": "u2", "sdp": "v=0"});
        let event = ClientEvent::from_envelope(envelope("rtc:offer", data.clone())).unwrap();
        assert_eq!(
            event,
            ClientEvent::Signal {
                name: "rtc:offer".to_string(),
                channel_id: "voice".to_string(),
                payload: data,
            }
        );
        assert_eq!(event.name(), "rtc:offer");
    }

    #[test]
    fn test_bare_signal_prefix_is_unrecognized() {
        let event = ClientEvent::from_envelope(envelope("rtc:", json!({"channelId": "c"}))).unwrap();
        assert_eq!(
            event,
            ClientEvent::Unrecognized {
                name: "rtc:".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_event() {
        let event = ClientEvent::from_envelope(envelope("message_create", json!({}))).unwrap();
        assert!(matches!(event, ClientEvent::Unrecognized { ref name } if name == "message_create"));
    }

    #[test]
    fn test_missing_channel_id() {
        let err = ClientEvent::from_envelope(envelope("subscribe_channel", json!({"id": "c1"})))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref event, .. } if event == "subscribe_channel"));
    }

    #[test]
    fn test_presence_update_shape() {
        let user = Uuid::new_v4();
        let env = Envelope::presence_update(user, PresenceStatus::Offline);
        assert_eq!(env.event, "presence_update");
        assert_eq!(env.data["userId"], json!(user.to_string()));
        assert_eq!(env.data["status"], json!("offline"));
    }

    #[test]
    fn test_signal_attaches_sender() {
        let sender = Uuid::new_v4();
        let env = Envelope::signal(
            "rtc:ice_candidate",
            json!({"channelId": "c", "candidate": "x", "senderId": "forged"}),
            sender,
            "alice",
        );
        assert_eq!(env.event, "rtc:ice_candidate");
        assert_eq!(env.data["candidate"], json!("x"));
        assert_eq!(env.data["senderId"], json!(sender.to_string()));
        assert_eq!(env.data["senderUsername"], json!("alice"));
    }

    #[test]
    fn test_with_payload_wraps_stored_entities() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct StoredMessage {
            id: u32,
            channel_id: &'static str,
            content: &'static str,
        }

        let edited = Envelope::with_payload(
            names::MESSAGE_UPDATE,
            &StoredMessage {
                id: 7,
                channel_id: "general",
                content: "edited",
            },
        )
        .unwrap();
        assert_eq!(edited.event, "message_update");
        assert_eq!(
            edited.data,
            json!({"id": 7, "channelId": "general", "content": "edited"})
        );

        let deleted =
            Envelope::with_payload(names::MESSAGE_DELETE, &json!({"id": 7})).unwrap();
        assert_eq!(deleted.event, "message_delete");
        assert_eq!(deleted.data["id"], json!(7));
    }
}
