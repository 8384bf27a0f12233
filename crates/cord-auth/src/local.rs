//! Local mode: this instance owns its users and signs its own tokens.
//!
//! Access tokens are short-lived HS256 JWTs. Refresh tokens are opaque random
//! strings; only their SHA-256 digest is stored, and each one is single-use.
//!
//! An instance that also acts as the authority for federated instances signs
//! with a [`TokenAuthority`] instead, and then only accepts its own ES256
//! tokens.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::authority::TokenAuthority;
use crate::claims::{AccessClaims, TokenClaims};
use crate::error::{AuthError, AuthResult};
use crate::password;
use crate::store::{
    NewUser, RefreshTokenRecord, RefreshTokenStore, StoreError, UserRecord, UserStore,
};

const REFRESH_TOKEN_BYTES: usize = 32;

#[derive(Clone)]
pub struct LocalAuthConfig {
    pub secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl LocalAuthConfig {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
        }
    }
}

impl fmt::Debug for LocalAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAuthConfig")
            .field("secret", &"<redacted>")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub password: String,
}

/// A freshly issued token pair and the user it belongs to.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserRecord,
}

pub struct LocalAuth {
    config: LocalAuthConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    authority: Option<TokenAuthority>,
    users: Arc<dyn UserStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
}

impl fmt::Debug for LocalAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAuth")
            .field("config", &self.config)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

impl LocalAuth {
    pub fn new(
        config: LocalAuthConfig,
        users: Arc<dyn UserStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        let encoding = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding,
            decoding,
            authority: None,
            users,
            refresh_tokens,
        }
    }

    /// Sign access tokens with `authority` instead of the shared secret.
    #[must_use]
    pub fn with_authority(mut self, authority: TokenAuthority) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn authority(&self) -> Option<&TokenAuthority> {
        self.authority.as_ref()
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    pub async fn register(&self, request: RegisterRequest) -> AuthResult<AuthSession> {
        let password_hash = password::hash_password(request.password).await?;
        let user = self
            .users
            .create_user(NewUser {
                email: request.email,
                username: request.username,
                display_name: request.display_name,
                password_hash,
            })
            .await
            .map_err(|err| match err {
                StoreError::Conflict(_) => AuthError::UserExists,
                other => AuthError::Store(other),
            })?;
        debug!(user = %user.id, "Registered user");
        self.start_session(user).await
    }

    /// Exchange credentials for a token pair.
    ///
    /// Unknown email, missing hash and wrong password are indistinguishable.
    pub async fn login(&self, email: &str, password: &str) -> AuthResult<AuthSession> {
        let Some(user) = self.users.user_by_email(email).await? else {
            password::verify_dummy(password.to_string()).await;
            return Err(AuthError::InvalidCredentials);
        };
        let Some(stored) = user.password_hash.clone() else {
            password::verify_dummy(password.to_string()).await;
            return Err(AuthError::InvalidCredentials);
        };
        if !password::verify_password(password.to_string(), stored).await? {
            return Err(AuthError::InvalidCredentials);
        }
        self.start_session(user).await
    }

    /// Rotate a refresh token.
    ///
    /// The presented token is consumed whether or not it is still valid.
    /// Concurrent refreshes of the same token yield at most one new pair.
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<AuthSession> {
        let hash = hash_refresh_token(refresh_token);
        let Some(stored) = self.refresh_tokens.refresh_token_by_hash(&hash).await? else {
            return Err(AuthError::InvalidToken);
        };

        if stored.is_expired_at(Utc::now()) {
            self.refresh_tokens.delete_refresh_token(stored.id).await?;
            return Err(AuthError::TokenExpired);
        }
        if !self.refresh_tokens.delete_refresh_token(stored.id).await? {
            debug!(user = %stored.user_id, "Refresh token already consumed");
            return Err(AuthError::InvalidToken);
        }

        let Some(user) = self.users.user_by_id(stored.user_id).await? else {
            warn!(user = %stored.user_id, "Refresh token for unknown user");
            return Err(AuthError::InvalidToken);
        };
        self.start_session(user).await
    }

    /// Revoke a refresh token. Unknown tokens are not an error.
    pub async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        let hash = hash_refresh_token(refresh_token);
        if let Some(stored) = self.refresh_tokens.refresh_token_by_hash(&hash).await? {
            self.refresh_tokens.delete_refresh_token(stored.id).await?;
        }
        Ok(())
    }

    pub fn issue_access_token(&self, claims: &TokenClaims) -> AuthResult<String> {
        if let Some(authority) = &self.authority {
            return authority.issue(claims, self.config.access_ttl);
        }
        let body = AccessClaims::new(claims, Utc::now(), self.config.access_ttl);
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &body, &self.encoding)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    /// Verify an access token issued by this instance.
    pub fn validate_access_token(&self, token: &str) -> AuthResult<TokenClaims> {
        if let Some(authority) = &self.authority {
            return authority.verify(token);
        }
        let validation = Validation::new(Algorithm::HS256);
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation)?;
        data.claims.into_token_claims()
    }

    async fn start_session(&self, user: UserRecord) -> AuthResult<AuthSession> {
        let access_token = self.issue_access_token(&user.token_claims())?;
        let refresh_token = generate_refresh_token();
        let now = Utc::now();
        self.refresh_tokens
            .create_refresh_token(RefreshTokenRecord {
                id: Uuid::new_v4(),
                user_id: user.id,
                token_hash: hash_refresh_token(&refresh_token),
                expires_at: now + self.config.refresh_ttl,
                created_at: now,
            })
            .await?;
        Ok(AuthSession {
            access_token,
            refresh_token,
            user,
        })
    }
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of a refresh token, hex encoded. This is the only form stored.
#[must_use]
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
