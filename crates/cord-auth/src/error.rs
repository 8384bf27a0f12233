use thiserror::Error;

use crate::store::StoreError;

/// Authentication failures.
///
/// The first four variants are the only ones a client should ever be able to
/// distinguish; the rest are server-side faults.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("user already exists")]
    UserExists,
    #[error("signing keys unavailable: {0}")]
    KeyFetch(#[from] KeySetError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("password hashing failed")]
    Hashing,
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl AuthError {
    /// Whether the failure is the caller's fault rather than the server's.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials
                | AuthError::InvalidToken
                | AuthError::TokenExpired
                | AuthError::UserExists
        )
    }
}

/// Every access token rejection, expiry included, is `InvalidToken`.
/// `TokenExpired` belongs to refresh tokens.
impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        tracing::debug!(error = %err, "Rejected access token");
        AuthError::InvalidToken
    }
}

/// Failures while fetching a published key set.
#[derive(Debug, Error)]
pub enum KeySetError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid key set: {0}")]
    Decode(String),
}

pub type AuthResult<T> = Result<T, AuthError>;
