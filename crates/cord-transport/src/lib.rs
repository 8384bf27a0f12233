//! # cord-transport
//!
//! Socket abstraction and connection pumps for the Cord realtime engine.
//!
//! A connected client is served by [`session::run_session`], which runs a
//! read pump and a write pump over any socket implementing the
//! [`FrameSink`]/[`FrameStream`] pair:
//!
//! - **WebSocket** - axum's WebSocket, split into its two halves
//! - **Memory** - in-process channels, for tests
//!
//! ```rust,ignore
//! use cord_transport::{run_session, websocket, SessionConfig};
//!
//! let (sink, stream) = websocket::split(socket);
//! run_session(hub, identity, sink, stream, SessionConfig::default()).await;
//! ```

pub mod memory;
pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use session::{run_session, SessionConfig, SessionEnd};
pub use traits::{FrameSink, FrameStream, TransportError, WireMessage};
