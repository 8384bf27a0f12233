//! Account routes: registration, login, token refresh, logout and the
//! caller's own profile.
//!
//! Everything except `GET /api/users/me` is only mounted when this instance
//! issues its own tokens.

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use cord_auth::{
    AuthSession, LocalAuth, ProfileUpdate, RegisterRequest, TokenClaims, TokenValidator,
    UserRecord,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

pub fn api_routes(state: &AppState) -> Router<Arc<AppState>> {
    if !state.auth.issues_tokens() {
        return Router::new().route("/api/users/me", get(get_me));
    }
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/logout", delete(logout))
        .route("/api/users/me", get(get_me).patch(update_me))
}

/// Success body wrapper: `{"data": ...}`.
#[derive(Debug, Serialize)]
pub struct Data<T> {
    pub data: T,
}

fn data<T>(value: T) -> Json<Data<T>> {
    Json(Data { data: value })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBody {
    pub id: Uuid,
    pub email: Option<String>,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl From<UserRecord> for UserBody {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
            created_at: user.created_at,
            last_seen_at: user.last_seen_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBody {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserBody,
}

impl From<AuthSession> for TokenBody {
    fn from(session: AuthSession) -> Self {
        Self {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            user: session.user.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBody {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileBody {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Claims of the bearer token on the request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub TokenClaims);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .filter(|token| !token.is_empty());
        let Some(token) = token else {
            metrics::record_auth_failure("http");
            return Err(ApiError::Unauthorized);
        };
        match state.auth.validate(token).await {
            Ok(claims) => Ok(AuthUser(claims)),
            Err(e) => {
                metrics::record_auth_failure("http");
                Err(e.into())
            }
        }
    }
}

fn local(state: &AppState) -> Result<&LocalAuth, ApiError> {
    state
        .auth
        .as_local()
        .ok_or_else(|| ApiError::NotFound("not found".to_string()))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|_| ApiError::BadRequest("invalid request body".to_string()))
}

async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Data<TokenBody>>), ApiError> {
    let request = body(payload)?;
    let email = request.email.trim().to_string();
    let username = request.username.trim().to_string();
    let display_name = request.display_name.trim().to_string();
    if email.is_empty() || username.is_empty() || display_name.is_empty() || request.password.is_empty()
    {
        return Err(ApiError::BadRequest("all fields are required".to_string()));
    }
    if !email.contains('@') {
        return Err(ApiError::BadRequest("invalid email".to_string()));
    }

    let session = local(&state)?
        .register(RegisterRequest {
            email,
            username,
            display_name,
            password: request.password,
        })
        .await?;
    Ok((StatusCode::CREATED, data(session.into())))
}

async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Result<Json<Data<TokenBody>>, ApiError> {
    let request = body(payload)?;
    let session = local(&state)?
        .login(&request.email, &request.password)
        .await
        .map_err(|e| {
            metrics::record_auth_failure("login");
            e
        })?;
    Ok(data(session.into()))
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<Json<Data<TokenBody>>, ApiError> {
    let request = body(payload)?;
    let session = local(&state)?.refresh(&request.refresh_token).await?;
    Ok(data(session.into()))
}

async fn logout(
    AuthUser(_claims): AuthUser,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let request = body(payload)?;
    local(&state)?.logout(&request.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_me(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Data<UserBody>>, ApiError> {
    let user = state
        .auth
        .users()
        .user_by_id(claims.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
    Ok(data(user.into()))
}

async fn update_me(
    AuthUser(claims): AuthUser,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ProfileBody>, JsonRejection>,
) -> Result<Json<Data<UserBody>>, ApiError> {
    let request = body(payload)?;
    let display_name = request.display_name.map(|name| name.trim().to_string());
    if display_name.as_deref().is_some_and(str::is_empty) {
        return Err(ApiError::BadRequest("display name cannot be empty".to_string()));
    }

    let user = state
        .auth
        .users()
        .update_profile(
            claims.user_id,
            ProfileUpdate {
                display_name,
                avatar_url: request.avatar_url,
            },
        )
        .await?;
    Ok(data(user.into()))
}
