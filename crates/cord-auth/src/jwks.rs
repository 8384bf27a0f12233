//! Published key sets and the client that consumes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::KeySetError;

/// Path of the key set relative to the authority base URL.
pub const KEY_SET_PATH: &str = "/.well-known/jwks.json";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKey {
    pub kty: String,
    pub kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_field: Option<String>,
    #[serde(default)]
    pub crv: String,
    #[serde(default)]
    pub x: String,
    #[serde(default)]
    pub y: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedKeySet {
    pub keys: Vec<PublishedKey>,
}

type KeyMap = HashMap<String, DecodingKey>;

/// Cached verification keys of a remote authority.
///
/// The whole map is swapped on every successful refresh; readers hold an
/// `Arc` snapshot and never see a half-updated set.
pub struct KeySetClient {
    url: String,
    client: reqwest::Client,
    keys: RwLock<Arc<KeyMap>>,
}

impl std::fmt::Debug for KeySetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kids: Vec<String> = self.keys.read().keys().cloned().collect();
        kids.sort();
        f.debug_struct("KeySetClient")
            .field("url", &self.url)
            .field("kids", &kids)
            .finish()
    }
}

impl KeySetClient {
    /// Build a client for `authority_url` without fetching anything.
    pub fn new(authority_url: &str) -> Result<Self, KeySetError> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            url: format!("{}{KEY_SET_PATH}", authority_url.trim_end_matches('/')),
            client,
            keys: RwLock::new(Arc::new(HashMap::new())),
        })
    }

    /// Build a client and perform the initial fetch. Failure here is fatal.
    pub async fn connect(authority_url: &str) -> Result<Self, KeySetError> {
        let client = Self::new(authority_url)?;
        let count = client.refresh().await?;
        if count == 0 {
            return Err(KeySetError::Decode("no usable keys".to_string()));
        }
        info!(url = %client.url, keys = count, "Loaded signing keys");
        Ok(client)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the key set and replace the cache.
    ///
    /// Returns the number of usable keys. Any well-formed response replaces
    /// the cache, even one with no usable key, so revoked keys stop
    /// verifying. Transport and decode failures leave the cache untouched.
    pub async fn refresh(&self) -> Result<usize, KeySetError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeySetError::Status(status));
        }
        let set: PublishedKeySet = response
            .json()
            .await
            .map_err(|err| KeySetError::Decode(err.to_string()))?;

        let keys = decode_key_set(&set);
        let count = keys.len();
        if count == 0 {
            warn!(url = %self.url, "Key set has no usable keys");
        }
        *self.keys.write() = Arc::new(keys);
        debug!(url = %self.url, keys = count, "Refreshed signing keys");
        Ok(count)
    }

    /// Current snapshot of the cache.
    pub fn snapshot(&self) -> Arc<KeyMap> {
        self.keys.read().clone()
    }

    pub fn key(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().get(kid).cloned()
    }

    /// Look up `kid`, refetching the set once on a miss.
    pub async fn key_or_refetch(&self, kid: &str) -> Result<Option<DecodingKey>, KeySetError> {
        if let Some(key) = self.key(kid) {
            return Ok(Some(key));
        }
        debug!(kid = %kid, "Unknown key id, refetching key set");
        self.refresh().await?;
        Ok(self.key(kid))
    }

    /// Refresh the cache every `interval` until the returned task is stopped.
    /// Failed fetches are logged and the last good set stays in place.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> RefreshTask {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Err(err) = client.refresh().await {
                            warn!(url = %client.url, error = %err, "Signing key refresh failed");
                        }
                    }
                }
            }
            debug!(url = %client.url, "Key refresh task stopped");
        });
        RefreshTask {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

fn decode_key_set(set: &PublishedKeySet) -> KeyMap {
    let mut keys = HashMap::with_capacity(set.keys.len());
    for key in &set.keys {
        if key.kty != "EC" || key.crv != "P-256" {
            warn!(kid = %key.kid, kty = %key.kty, crv = %key.crv, "Skipping unsupported key");
            continue;
        }
        if key.alg.as_deref().is_some_and(|alg| alg != "ES256") {
            warn!(kid = %key.kid, "Skipping key with non-ES256 alg");
            continue;
        }
        match DecodingKey::from_ec_components(&key.x, &key.y) {
            Ok(decoding) => {
                keys.insert(key.kid.clone(), decoding);
            }
            Err(err) => warn!(kid = %key.kid, error = %err, "Skipping malformed key"),
        }
    }
    keys
}

/// Handle to the background key refresh loop.
#[derive(Debug)]
pub struct RefreshTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshTask {
    /// Ask the loop to stop. Never blocks; calling it twice is harmless.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.stop();
    }
}
