//! # Cord Server
//!
//! Realtime hub and auth server for Cord chat.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file (cord.toml, /etc/cord/cord.toml or
//! # ~/.config/cord/cord.toml)
//! cord
//!
//! # Run with environment variables
//! CORD_PORT=8080 CORD_AUTH__JWT_SECRET=change-me cord
//!
//! # Trust tokens from a central authority
//! CORD_AUTH__MODE=federated CORD_AUTH__AUTHORITY_URL=https://auth.example.com cord
//! ```

use anyhow::Result;
use cord_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cord=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Cord server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
