//! Federated mode: tokens are signed by a remote authority and verified
//! against its published keys.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, Validation};
use tracing::{debug, warn};

use crate::claims::{AccessClaims, TokenClaims};
use crate::error::{AuthError, AuthResult};
use crate::jwks::KeySetClient;
use crate::store::UserStore;

pub struct FederatedAuth {
    keys: Arc<KeySetClient>,
    users: Arc<dyn UserStore>,
}

impl std::fmt::Debug for FederatedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedAuth")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl FederatedAuth {
    pub fn new(keys: Arc<KeySetClient>, users: Arc<dyn UserStore>) -> Self {
        Self { keys, users }
    }

    pub fn keys(&self) -> &Arc<KeySetClient> {
        &self.keys
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    /// Verify an authority-issued token and refresh the local user cache.
    ///
    /// Only ES256 with a `kid` header is accepted. An unknown `kid` triggers
    /// a single key set refetch before the token is rejected. A failed
    /// refetch also rejects the token as invalid.
    pub async fn validate_access_token(&self, token: &str) -> AuthResult<TokenClaims> {
        let header = jsonwebtoken::decode_header(token)?;
        if header.alg != Algorithm::ES256 {
            debug!(alg = ?header.alg, "Rejected token algorithm");
            return Err(AuthError::InvalidToken);
        }
        let kid = header.kid.as_deref().ok_or(AuthError::InvalidToken)?;
        let key = match self.keys.key_or_refetch(kid).await {
            Ok(Some(key)) => key,
            Ok(None) => return Err(AuthError::InvalidToken),
            Err(err) => {
                warn!(kid = %kid, error = %err, "Key set refetch failed");
                return Err(AuthError::InvalidToken);
            }
        };

        let validation = Validation::new(Algorithm::ES256);
        let data = jsonwebtoken::decode::<AccessClaims>(token, &key, &validation)?;
        let claims = data.claims.into_token_claims()?;

        // cache write failures do not reject a verified token
        if let Err(err) = self.users.upsert_from_claims(&claims).await {
            warn!(user = %claims.user_id, error = %err, "Failed to cache federated user");
        }
        Ok(claims)
    }
}
