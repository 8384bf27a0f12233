//! # cord-protocol
//!
//! Wire protocol definitions for the Cord realtime hub.
//!
//! Every message in either direction is a JSON envelope:
//!
//! ```json
//! { "event": "typing_start", "data": { "channelId": "..." } }
//! ```
//!
//! Inbound envelopes are decoded into the closed [`ClientEvent`] enum.
//! Outbound events are plain [`Envelope`] values built with the helpers on
//! [`Envelope`] and serialized once per broadcast by [`codec::encode`].
//!
//! ## Example
//!
//! ```rust
//! use cord_protocol::{codec, ClientEvent};
//!
//! let raw = br#"{"event":"subscribe_channel","data":{"channelId":"c1"}}"#;
//! let event = codec::decode_client(raw).unwrap();
//! assert_eq!(
//!     event,
//!     ClientEvent::SubscribeChannel { channel_id: "c1".to_string() }
//! );
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{
    decode, decode_client, decode_client_within, decode_within, encode, ProtocolError,
    MAX_MESSAGE_SIZE,
};
pub use envelope::{names, ClientEvent, Envelope, PresenceStatus};
