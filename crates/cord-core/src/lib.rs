//! # cord-core
//!
//! Connection hub for the Cord realtime engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Single-owner actor holding every live connection
//! - **Presence** - Per-user online tracking across devices
//! - **Subscriptions** - Channel membership for targeted fan-out
//! - **Connection** - Outbound queue and lifecycle of one client
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  commands   ┌─────────────┐     ┌───────────────┐
//! │  Connection │────────────▶│     Hub     │────▶│ Subscriptions │
//! │   pumps     │◀────────────│   (task)    │     └───────────────┘
//! └─────────────┘  try_send   └─────────────┘
//!                                    │
//!                                    ▼
//!                             ┌─────────────┐
//!                             │  Presence   │
//!                             └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod presence;
pub mod subscription;

pub use connection::{
    Connection, ConnectionId, Delivery, Lifecycle, LifecycleHandle, UserId, UserIdentity,
};
pub use hub::{Hub, HubConfig, HubError, HubState, HubStats, PresenceHook};
pub use presence::{PresenceRegistry, PresenceTransition};
pub use subscription::{validate_channel_id, ChannelId, SubscriptionIndex};
