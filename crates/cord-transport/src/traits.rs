//! Socket abstraction traits.
//!
//! A socket is split into a sending half and a receiving half so the two
//! connection pumps can own one each.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A single transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    /// Encoded UTF-8 text shared by every recipient of a broadcast.
    SharedText(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A write did not complete within its deadline.
    #[error("Write timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The sending half of a socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one message.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Send a close frame and shut the sending half down.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The receiving half of a socket.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next message.
    ///
    /// Returns `None` once the peer has gone away.
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError>;
}
