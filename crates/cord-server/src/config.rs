//! Server configuration.
//!
//! Configuration is assembled from, in increasing priority:
//! - defaults
//! - the first TOML file found in [`CONFIG_PATHS`]
//! - environment variables (`CORD_PORT`, `CORD_AUTH__JWT_SECRET`, ...)

use anyhow::{bail, Context, Result};
use cord_core::HubConfig;
use cord_transport::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Config file locations, first match wins.
pub const CONFIG_PATHS: [&str; 3] = [
    "cord.toml",
    "/etc/cord/cord.toml",
    "~/.config/cord/cord.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted inbound message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue. A subscriber whose queue is full is
    /// disconnected.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Hub command queue.
    #[serde(default = "default_hub_queue")]
    pub hub_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How long a connection may stay silent, in milliseconds. Pings go out
    /// at nine tenths of this.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Deadline for a single socket write, in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthModeSetting {
    Local,
    Federated,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_mode")]
    pub mode: AuthModeSetting,

    /// HS256 secret for local mode.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// PKCS#8 P-256 key. When set, a local instance signs ES256 tokens and
    /// publishes its key set for federated instances.
    #[serde(default)]
    pub signing_key_path: Option<String>,

    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,

    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: u64,

    /// Base URL of the token authority, for federated mode.
    #[serde(default)]
    pub authority_url: Option<String>,

    #[serde(default = "default_key_refresh")]
    pub key_refresh_interval_secs: u64,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("mode", &self.mode)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("signing_key_path", &self.signing_key_path)
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("authority_url", &self.authority_url)
            .field("key_refresh_interval_secs", &self.key_refresh_interval_secs)
            .finish()
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/api/ws".to_string()
}

fn default_max_message_size() -> usize {
    cord_protocol::MAX_MESSAGE_SIZE
}

fn default_outbound_queue() -> usize {
    256
}

fn default_hub_queue() -> usize {
    1024
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_auth_mode() -> AuthModeSetting {
    AuthModeSetting::Local
}

fn default_access_ttl() -> u64 {
    15 * 60
}

fn default_refresh_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_key_refresh() -> u64 {
    5 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
            hub_queue: default_hub_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            jwt_secret: None,
            signing_key_path: None,
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            authority_url: None,
            key_refresh_interval_secs: default_key_refresh(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `CORD_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result fails
    /// [`Config::validate`].
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());
        Self::assemble(file.as_deref(), environment())
    }

    fn assemble(file: Option<&str>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, without environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        match self.auth.mode {
            AuthModeSetting::Local => {
                let has_secret = self.auth.jwt_secret.as_deref().is_some_and(|s| !s.is_empty());
                if !has_secret && self.auth.signing_key_path.is_none() {
                    bail!("auth.mode = \"local\" requires auth.jwt_secret or auth.signing_key_path");
                }
            }
            AuthModeSetting::Federated => {
                if self.auth.authority_url.as_deref().map_or(true, str::is_empty) {
                    bail!("auth.mode = \"federated\" requires auth.authority_url");
                }
                if self.auth.key_refresh_interval_secs == 0 {
                    bail!("auth.key_refresh_interval_secs must be positive");
                }
            }
        }
        if self.heartbeat.pong_wait_ms == 0 || self.heartbeat.write_wait_ms == 0 {
            bail!("heartbeat timings must be positive");
        }
        if self.limits.outbound_queue == 0 || self.limits.hub_queue == 0 {
            bail!("queue capacities must be positive");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let mut session =
            SessionConfig::with_pong_wait(Duration::from_millis(self.heartbeat.pong_wait_ms));
        session.write_wait = Duration::from_millis(self.heartbeat.write_wait_ms);
        session.max_message_size = self.limits.max_message_size;
        session.outbound_capacity = self.limits.outbound_queue;
        session
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.limits.hub_queue,
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("CORD")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
