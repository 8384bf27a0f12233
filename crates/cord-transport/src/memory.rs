//! In-process socket backed by channels.
//!
//! [`pair`] returns the server's two halves plus a [`MemoryPeer`] that plays
//! the client. A peer that stops calling [`MemoryPeer::recv`] behaves like a
//! stalled client once the channel fills.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameStream, TransportError, WireMessage};

/// Create a connected in-memory socket.
///
/// `capacity` bounds each direction.
#[must_use]
pub fn pair(capacity: usize) -> (MemorySink, MemoryStream, MemoryPeer) {
    let (to_peer, from_server) = mpsc::channel(capacity.max(1));
    let (to_server, from_peer) = mpsc::channel(capacity.max(1));
    (
        MemorySink { tx: Some(to_peer) },
        MemoryStream { rx: from_peer },
        MemoryPeer {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

/// Server-side sending half.
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<WireMessage>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let tx = self.tx.take().ok_or(TransportError::ConnectionClosed)?;
        tx.send(WireMessage::Close)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Server-side receiving half.
#[derive(Debug)]
pub struct MemoryStream {
    rx: mpsc::Receiver<WireMessage>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// The client end of an in-memory socket.
#[derive(Debug)]
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<WireMessage>>,
    rx: mpsc::Receiver<WireMessage>,
}

impl MemoryPeer {
    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server half has been dropped or the peer has
    /// hung up.
    pub async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a text message to the server.
    ///
    /// # Errors
    ///
    /// See [`MemoryPeer::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(WireMessage::Text(text.into())).await
    }

    /// Receive the next message from the server.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }

    /// Stop sending; the server sees the stream end.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}
