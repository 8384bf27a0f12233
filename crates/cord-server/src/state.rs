//! Shared server state and its construction from configuration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use cord_auth::{
    AuthService, FederatedAuth, KeySetClient, LocalAuth, LocalAuthConfig, MemoryStore,
    RefreshTask, StoreError, TokenAuthority, UserStore,
};
use cord_core::{Hub, PresenceHook, UserId};
use cord_transport::SessionConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, AuthModeSetting, Config};

/// Shared server state.
pub struct AppState {
    pub hub: Hub,
    pub auth: AuthService,
    pub session: SessionConfig,
    pub config: Config,
}

/// Everything the server runs besides the HTTP listener.
pub struct Services {
    pub state: Arc<AppState>,
    pub hub_task: JoinHandle<()>,
    pub key_refresh: Option<RefreshTask>,
}

impl Services {
    /// Build the auth service and start the hub.
    ///
    /// # Errors
    ///
    /// Returns an error if signing keys cannot be loaded or, in federated
    /// mode, the authority's key set cannot be fetched.
    pub async fn start(config: Config, store: Arc<MemoryStore>) -> Result<Self> {
        let (auth, key_refresh) = build_auth(&config.auth, store).await?;
        let hook = Arc::new(LastSeenHook {
            users: auth.users().clone(),
        });
        let (hub, hub_task) = Hub::spawn_with_hook(config.hub_config(), hook);
        let state = Arc::new(AppState {
            hub,
            auth,
            session: config.session_config(),
            config,
        });
        Ok(Self {
            state,
            hub_task,
            key_refresh,
        })
    }
}

async fn build_auth(
    config: &AuthConfig,
    store: Arc<MemoryStore>,
) -> Result<(AuthService, Option<RefreshTask>)> {
    match config.mode {
        AuthModeSetting::Local => {
            let mut settings = LocalAuthConfig::new(config.jwt_secret.clone().unwrap_or_default());
            settings.access_ttl = seconds(config.access_token_ttl_secs);
            settings.refresh_ttl = seconds(config.refresh_token_ttl_secs);
            let mut local = LocalAuth::new(settings, store.clone(), store);
            if let Some(path) = &config.signing_key_path {
                let authority = TokenAuthority::from_pem_file(shellexpand::tilde(path).as_ref())
                    .with_context(|| format!("Failed to load signing key {path}"))?;
                info!(kid = %authority.kid(), "Signing access tokens with ES256 key");
                local = local.with_authority(authority);
            }
            info!("Auth mode: local");
            Ok((AuthService::Local(local), None))
        }
        AuthModeSetting::Federated => {
            let url = config
                .authority_url
                .as_deref()
                .context("auth.authority_url is required in federated mode")?;
            let keys = Arc::new(
                KeySetClient::connect(url)
                    .await
                    .with_context(|| format!("Failed to fetch signing keys from {url}"))?,
            );
            let refresh = keys.spawn_refresh(Duration::from_secs(config.key_refresh_interval_secs));
            info!(authority = %url, "Auth mode: federated");
            Ok((
                AuthService::Federated(FederatedAuth::new(keys, store)),
                Some(refresh),
            ))
        }
    }
}

/// Token lifetimes are capped at ten years.
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_TTL_SECS) as i64)
}

/// Records when a user's last connection closed.
struct LastSeenHook {
    users: Arc<dyn UserStore>,
}

#[async_trait]
impl PresenceHook for LastSeenHook {
    async fn on_user_offline(&self, user_id: UserId) {
        match self.users.touch_last_seen(user_id, Utc::now()).await {
            Ok(()) => debug!(user = %user_id, "Recorded last seen"),
            Err(StoreError::NotFound(_)) => debug!(user = %user_id, "Offline user not in store"),
            Err(e) => warn!(user = %user_id, error = %e, "Failed to record last seen"),
        }
    }
}
