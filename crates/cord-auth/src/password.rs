//! Argon2id password hashing.
//!
//! Both operations are CPU bound and run on the blocking pool.

use std::sync::OnceLock;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use tracing::warn;

use crate::error::AuthError;

/// Hash a password with a fresh salt, returning the PHC string.
pub async fn hash_password(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || hash_blocking(&password))
        .await
        .map_err(|_| AuthError::Hashing)?
}

/// Check a password against a stored PHC string.
///
/// A malformed stored hash verifies as `false`.
pub async fn verify_password(password: String, stored: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || verify_blocking(&password, &stored))
        .await
        .map_err(|_| AuthError::Hashing)
}

/// Burn the same work as a real verification for an account that does not
/// exist.
pub async fn verify_dummy(password: String) {
    let _ = tokio::task::spawn_blocking(move || {
        if let Some(stored) = dummy_hash() {
            verify_blocking(&password, stored);
        }
    })
    .await;
}

fn hash_blocking(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AuthError::Hashing)
}

fn verify_blocking(password: &str, stored: &str) -> bool {
    let parsed = match PasswordHash::new(stored) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "Stored password hash is malformed");
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| hash_blocking("cord-dummy-password").ok())
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_then_verify() {
        let hash = hash_password("correct horse".to_string())
            .await
            .expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse".to_string(), hash.clone())
            .await
            .expect("verify"));
        assert!(!verify_password("battery staple".to_string(), hash)
            .await
            .expect("verify"));
    }

    #[tokio::test]
    async fn salts_differ() {
        let a = hash_password("same".to_string()).await.expect("hash");
        let b = hash_password("same".to_string()).await.expect("hash");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn malformed_hash_never_matches() {
        assert!(!verify_password("x".to_string(), "plaintext".to_string())
            .await
            .expect("verify"));
        verify_dummy("anything".to_string()).await;
    }
}
