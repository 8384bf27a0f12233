//! Persistence seams used by the auth services.
//!
//! The realtime core never touches storage directly; these traits are the
//! narrow surface it consumes. [`memory::MemoryStore`] implements both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::claims::TokenClaims;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored user.
///
/// `email` and `password_hash` are only present for locally registered
/// users; federated users are a read-through cache of authority claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: Option<String>,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// Claims to embed in an access token for this user.
    #[must_use]
    pub fn token_claims(&self) -> TokenClaims {
        TokenClaims {
            user_id: self.id,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
}

/// Partial profile update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 of the token value, hex encoded.
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;
    async fn user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>>;
    /// Fails with [`StoreError::Conflict`] when the email or username is taken.
    async fn create_user(&self, user: NewUser) -> StoreResult<UserRecord>;
    async fn update_profile(&self, id: Uuid, update: ProfileUpdate) -> StoreResult<UserRecord>;
    /// Insert or refresh a user from validated token claims. Email and
    /// password are never touched.
    async fn upsert_from_claims(&self, claims: &TokenClaims) -> StoreResult<UserRecord>;
    async fn touch_last_seen(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn create_refresh_token(&self, token: RefreshTokenRecord) -> StoreResult<()>;
    async fn refresh_token_by_hash(&self, token_hash: &str)
    -> StoreResult<Option<RefreshTokenRecord>>;
    /// Returns `true` only for the caller that actually removed the token.
    async fn delete_refresh_token(&self, id: Uuid) -> StoreResult<bool>;
}
