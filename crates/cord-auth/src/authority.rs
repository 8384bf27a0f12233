//! Authority side of federated mode: signs ES256 tokens and publishes the
//! matching key set so other instances can verify them.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sha2::{Digest, Sha256};

use crate::claims::{AccessClaims, TokenClaims};
use crate::error::{AuthError, AuthResult};
use crate::jwks::{PublishedKey, PublishedKeySet};

const COORDINATE_LEN: usize = 32;
/// BIT STRING header of an uncompressed P-256 point: tag, length, unused bits.
const POINT_PREFIX: [u8; 4] = [0x03, 0x42, 0x00, 0x04];

/// Cache policy for the published key set.
pub const KEY_SET_CACHE_CONTROL: &str = "public, max-age=300";

pub struct TokenAuthority {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public: PublishedKey,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl TokenAuthority {
    /// Load a PKCS#8 P-256 private key.
    ///
    /// The key must embed its public point (OpenSSL and most tooling do);
    /// the key id is derived from it.
    pub fn from_pem(pem: &[u8]) -> AuthResult<Self> {
        let encoding =
            EncodingKey::from_ec_pem(pem).map_err(|err| AuthError::Signing(err.to_string()))?;
        let (x, y) = public_point(pem)?;
        let x = URL_SAFE_NO_PAD.encode(x);
        let y = URL_SAFE_NO_PAD.encode(y);
        let decoding = DecodingKey::from_ec_components(&x, &y)
            .map_err(|err| AuthError::Signing(err.to_string()))?;
        let kid = key_id(&x, &y);
        Ok(Self {
            public: PublishedKey {
                kty: "EC".to_string(),
                kid: kid.clone(),
                alg: Some("ES256".to_string()),
                use_field: Some("sig".to_string()),
                crv: "P-256".to_string(),
                x,
                y,
            },
            kid,
            encoding,
            decoding,
        })
    }

    /// Load a key from a PEM file.
    pub fn from_pem_file(path: impl AsRef<std::path::Path>) -> AuthResult<Self> {
        let pem = std::fs::read(path.as_ref()).map_err(|err| {
            AuthError::Signing(format!("read {}: {err}", path.as_ref().display()))
        })?;
        Self::from_pem(&pem)
    }

    /// Override the derived key id.
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = kid.into();
        self.public.kid = self.kid.clone();
        self
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn issue(&self, claims: &TokenClaims, ttl: Duration) -> AuthResult<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());
        let body = AccessClaims::new(claims, Utc::now(), ttl);
        jsonwebtoken::encode(&header, &body, &self.encoding)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    /// Verify a token this authority issued.
    pub fn verify(&self, token: &str) -> AuthResult<TokenClaims> {
        let header = jsonwebtoken::decode_header(token)?;
        if header.alg != Algorithm::ES256 || header.kid.as_deref() != Some(self.kid.as_str()) {
            return Err(AuthError::InvalidToken);
        }
        let validation = Validation::new(Algorithm::ES256);
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation)?;
        data.claims.into_token_claims()
    }

    pub fn key_set(&self) -> PublishedKeySet {
        PublishedKeySet {
            keys: vec![self.public.clone()],
        }
    }
}

fn public_point(pem: &[u8]) -> AuthResult<([u8; COORDINATE_LEN], [u8; COORDINATE_LEN])> {
    let invalid = || AuthError::Signing("key does not embed a P-256 public point".to_string());
    let text = std::str::from_utf8(pem).map_err(|_| invalid())?;
    let body: String = text
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = STANDARD.decode(body.trim()).map_err(|_| invalid())?;

    let point_len = POINT_PREFIX.len() + 2 * COORDINATE_LEN;
    let tail = der.len().checked_sub(point_len).map(|at| &der[at..]).ok_or_else(invalid)?;
    if tail[..POINT_PREFIX.len()] != POINT_PREFIX {
        return Err(invalid());
    }
    let coordinates = &tail[POINT_PREFIX.len()..];
    let mut x = [0u8; COORDINATE_LEN];
    let mut y = [0u8; COORDINATE_LEN];
    x.copy_from_slice(&coordinates[..COORDINATE_LEN]);
    y.copy_from_slice(&coordinates[COORDINATE_LEN..]);
    Ok((x, y))
}

/// First 16 bytes of SHA-256 over the encoded coordinates, base64url.
fn key_id(x: &str, y: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(x.as_bytes());
    hasher.update(b".");
    hasher.update(y.as_bytes());
    URL_SAFE_NO_PAD.encode(&hasher.finalize()[..16])
}
