//! # cord-server
//!
//! HTTP and WebSocket boundary of the Cord realtime core.
//!
//! - `GET /api/ws?token=...` upgrades an authenticated client into a hub
//!   session
//! - `/api/auth/*` and `/api/users/me` manage accounts when this instance
//!   issues its own tokens
//! - `GET /health` reports liveness

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::ApiError;
pub use handlers::{build_app, run_server};
pub use state::{AppState, Services};
