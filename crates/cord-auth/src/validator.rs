use std::sync::Arc;

use async_trait::async_trait;

use crate::claims::TokenClaims;
use crate::error::AuthResult;
use crate::federated::FederatedAuth;
use crate::local::LocalAuth;
use crate::store::UserStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Local,
    Federated,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Local => "local",
            AuthMode::Federated => "federated",
        }
    }
}

/// Turns a bearer token into an identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, bearer: &str) -> AuthResult<TokenClaims>;
    fn mode(&self) -> AuthMode;
}

#[async_trait]
impl TokenValidator for LocalAuth {
    async fn validate(&self, bearer: &str) -> AuthResult<TokenClaims> {
        self.validate_access_token(bearer)
    }

    fn mode(&self) -> AuthMode {
        AuthMode::Local
    }
}

#[async_trait]
impl TokenValidator for FederatedAuth {
    async fn validate(&self, bearer: &str) -> AuthResult<TokenClaims> {
        self.validate_access_token(bearer).await
    }

    fn mode(&self) -> AuthMode {
        AuthMode::Federated
    }
}

/// The auth mode an instance runs in, fixed at startup.
#[derive(Debug)]
pub enum AuthService {
    Local(LocalAuth),
    Federated(FederatedAuth),
}

impl AuthService {
    /// Whether this instance registers users and issues tokens itself.
    pub fn issues_tokens(&self) -> bool {
        matches!(self, AuthService::Local(_))
    }

    pub fn as_local(&self) -> Option<&LocalAuth> {
        match self {
            AuthService::Local(local) => Some(local),
            AuthService::Federated(_) => None,
        }
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        match self {
            AuthService::Local(local) => local.users(),
            AuthService::Federated(federated) => federated.users(),
        }
    }
}

#[async_trait]
impl TokenValidator for AuthService {
    async fn validate(&self, bearer: &str) -> AuthResult<TokenClaims> {
        match self {
            AuthService::Local(local) => local.validate(bearer).await,
            AuthService::Federated(federated) => federated.validate(bearer).await,
        }
    }

    fn mode(&self) -> AuthMode {
        match self {
            AuthService::Local(local) => local.mode(),
            AuthService::Federated(federated) => federated.mode(),
        }
    }
}
