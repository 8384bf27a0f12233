//! Bearer token issuance and validation for Cord.
//!
//! An instance runs in exactly one [`AuthMode`]:
//!
//! - **local**: users register here, passwords are Argon2id hashed, access
//!   tokens are HS256 JWTs signed with an instance secret and refresh tokens
//!   are single-use opaque strings.
//! - **federated**: tokens are ES256 JWTs from a remote authority, verified
//!   against its published key set, which [`KeySetClient`] keeps fresh in the
//!   background.
//!
//! Both modes sit behind [`TokenValidator`], so the realtime layers only ever
//! see [`TokenClaims`].

pub mod authority;
pub mod claims;
pub mod error;
pub mod federated;
pub mod jwks;
pub mod local;
pub mod password;
pub mod store;
pub mod validator;

pub use authority::{TokenAuthority, KEY_SET_CACHE_CONTROL};
pub use claims::{AccessClaims, TokenClaims};
pub use error::{AuthError, AuthResult, KeySetError};
pub use federated::FederatedAuth;
pub use jwks::{KeySetClient, PublishedKey, PublishedKeySet, RefreshTask, KEY_SET_PATH};
pub use local::{AuthSession, LocalAuth, LocalAuthConfig, RegisterRequest};
pub use store::{
    MemoryStore, NewUser, ProfileUpdate, RefreshTokenRecord, RefreshTokenStore, StoreError,
    StoreResult, UserRecord, UserStore,
};
pub use validator::{AuthMode, AuthService, TokenValidator};
