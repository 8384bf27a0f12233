//! Codec for encoding and decoding Cord envelopes.
//!
//! Envelopes travel as single WebSocket text messages, so there is no length
//! prefix: one message is one JSON document.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::{ClientEvent, Envelope};

/// Maximum accepted size of one inbound message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Inbound message exceeds the accepted size.
    #[error("Message size {size} exceeds maximum {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A known event arrived with an unusable payload.
    #[error("Invalid payload for '{event}': {reason}")]
    InvalidPayload { event: String, reason: String },
}

/// Encode an envelope to bytes.
///
/// The result is shared across every recipient of a broadcast, so callers
/// encode once and clone the `Bytes` handle per subscriber.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let buf = serde_json::to_vec(envelope)?;
    Ok(Bytes::from(buf))
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the message is larger than [`MAX_MESSAGE_SIZE`] or is
/// not a JSON envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    decode_within(data, MAX_MESSAGE_SIZE)
}

/// Decode an envelope, enforcing a caller-supplied size limit.
///
/// # Errors
///
/// Returns an error if the message is larger than `limit` or is not a JSON
/// envelope.
pub fn decode_within(data: &[u8], limit: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > limit {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            limit,
        });
    }
    Ok(serde_json::from_slice(data)?)
}

/// Decode a client-originated message straight into a [`ClientEvent`].
///
/// # Errors
///
/// Returns an error if decoding fails or a known event has a malformed
/// payload. Unknown event names are not an error.
pub fn decode_client(data: &[u8]) -> Result<ClientEvent, ProtocolError> {
    decode_client_within(data, MAX_MESSAGE_SIZE)
}

/// Like [`decode_client`], with a caller-supplied size limit.
///
/// # Errors
///
/// See [`decode_within`] and [`ClientEvent::from_envelope`].
pub fn decode_client_within(data: &[u8], limit: usize) -> Result<ClientEvent, ProtocolError> {
    ClientEvent::from_envelope(decode_within(data, limit)?)
}
