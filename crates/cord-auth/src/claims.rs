//! Token claims.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;

/// Identity established by a validated access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Access token body as it appears inside the JWT.
///
/// Shared by locally issued HS256 tokens and authority-issued ES256 tokens.
/// Profile fields are optional on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    #[must_use]
    pub fn new(claims: &TokenClaims, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            sub: claims.user_id.to_string(),
            username: claims.username.clone(),
            display_name: claims.display_name.clone(),
            avatar_url: claims.avatar_url.clone(),
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
        }
    }

    /// Convert into [`TokenClaims`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if `sub` is not a UUID.
    pub fn into_token_claims(self) -> Result<TokenClaims, AuthError> {
        let user_id = Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken)?;
        Ok(TokenClaims {
            user_id,
            username: self.username,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_must_be_uuid() {
        let claims = AccessClaims {
            sub: "not-a-uuid".to_string(),
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
            avatar_url: None,
            iat: 0,
            exp: 1,
        };
        assert!(matches!(
            claims.into_token_claims(),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn profile_fields_default_when_absent() {
        let user = Uuid::new_v4();
        let raw = serde_json::json!({"sub": user.to_string(), "iat": 1, "exp": 2});
        let claims: AccessClaims = serde_json::from_value(raw).expect("decode");
        let claims = claims.into_token_claims().expect("valid subject");
        assert_eq!(claims.user_id, user);
        assert!(claims.username.is_empty());
        assert_eq!(claims.avatar_url, None);
    }

    #[test]
    fn expiry_follows_ttl() {
        let now = Utc::now();
        let token = TokenClaims {
            user_id: Uuid::new_v4(),
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
            avatar_url: Some("https://example.test/a.png".to_string()),
        };
        let access = AccessClaims::new(&token, now, Duration::minutes(15));
        assert_eq!(access.exp - access.iat, 900);
        assert_eq!(access.sub, token.user_id.to_string());
    }
}
