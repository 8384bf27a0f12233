//! axum WebSocket adapter.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::trace;

use crate::traits::{FrameSink, FrameStream, TransportError, WireMessage};

/// Split an upgraded WebSocket into its sending and receiving halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WebSocketSink, WebSocketStream) {
    let (sink, stream) = socket.split();
    (WebSocketSink { inner: sink }, WebSocketStream { inner: stream })
}

/// Sending half of an axum WebSocket.
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            // axum owns its text as `String`; this is the only copy of a shared frame
            WireMessage::SharedText(data) => Message::Text(
                std::str::from_utf8(&data)
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?
                    .to_owned(),
            ),
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
            WireMessage::Ping(data) => Message::Ping(data.to_vec()),
            WireMessage::Pong(data) => Message::Pong(data.to_vec()),
            WireMessage::Close => Message::Close(None),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The peer may already be gone; closing is best effort.
        if let Err(e) = self.inner.send(Message::Close(None)).await {
            trace!(error = %e, "Close frame not delivered");
        }
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Receiving half of an axum WebSocket.
pub struct WebSocketStream {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            Some(Ok(message)) => Ok(Some(match message {
                Message::Text(text) => WireMessage::Text(text),
                Message::Binary(data) => WireMessage::Binary(Bytes::from(data)),
                Message::Ping(data) => WireMessage::Ping(Bytes::from(data)),
                Message::Pong(data) => WireMessage::Pong(Bytes::from(data)),
                Message::Close(_) => WireMessage::Close,
            })),
        }
    }
}
