//! Connection handlers for the Cord server.
//!
//! The WebSocket endpoint authenticates before upgrading, then hands the
//! socket to a transport session bound to the shared hub.

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::routes;
use crate::state::{AppState, Services};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cord_auth::{LocalAuth, MemoryStore, TokenClaims, TokenValidator, KEY_SET_CACHE_CONTROL, KEY_SET_PATH};
use cord_core::UserIdentity;
use cord_transport::{
    run_session, websocket, FrameSink, FrameStream, TransportError, WireMessage,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(routes::api_routes(&state));

    if state.auth.as_local().and_then(LocalAuth::authority).is_some() {
        app = app.route(KEY_SET_PATH, get(key_set_handler));
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the services cannot start or the listener fails.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let websocket_path = config.transport.websocket_path.clone();
    let services = Services::start(config, Arc::new(MemoryStore::new())).await?;
    let app = build_app(services.state.clone());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Cord server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(refresh) = services.key_refresh {
        refresh.shutdown().await;
    }
    info!("Cord server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "auth": state.auth.mode().as_str(),
        "onlineUsers": state.hub.online_users().len(),
    }))
}

/// Published key set, when this instance signs with an ES256 key.
async fn key_set_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.auth.as_local().and_then(LocalAuth::authority) {
        Some(authority) => (
            [(header::CACHE_CONTROL, KEY_SET_CACHE_CONTROL)],
            Json(authority.key_set()),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// WebSocket upgrade handler. The token is checked before upgrading.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = params.token.filter(|token| !token.is_empty()) else {
        metrics::record_auth_failure("websocket");
        return ApiError::Unauthorized.into_response();
    };
    let claims = match state.auth.validate(&token).await {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "Rejected WebSocket token");
            metrics::record_auth_failure("websocket");
            return ApiError::from(e).into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade.on_upgrade(move |socket| handle_websocket(socket, state, claims))
}

/// Serve an upgraded, authenticated WebSocket.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, claims: TokenClaims) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let identity = UserIdentity::new(claims.user_id, claims.username, claims.display_name);
    let (sink, stream) = websocket::split(socket);

    let end = run_session(
        state.hub.clone(),
        identity,
        MeteredSink(sink),
        MeteredStream(stream),
        state.session.clone(),
    )
    .await;

    metrics::record_session_end(end);
    if let Ok(stats) = state.hub.stats().await {
        metrics::record_hub_stats(&stats);
    }
}

/// Counts outbound messages.
struct MeteredSink<S>(S);

#[async_trait]
impl<S: FrameSink> FrameSink for MeteredSink<S> {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        match &message {
            WireMessage::Text(text) => metrics::record_message(text.len(), "outbound"),
            WireMessage::SharedText(data) | WireMessage::Binary(data) => {
                metrics::record_message(data.len(), "outbound")
            }
            _ => {}
        }
        self.0.send(message).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.close().await
    }
}

/// Counts inbound messages.
struct MeteredStream<R>(R);

#[async_trait]
impl<R: FrameStream> FrameStream for MeteredStream<R> {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        let message = self.0.recv().await;
        match &message {
            Ok(Some(WireMessage::Text(text))) => metrics::record_message(text.len(), "inbound"),
            Ok(Some(WireMessage::Binary(data))) => metrics::record_message(data.len(), "inbound"),
            Err(_) => metrics::record_error("websocket"),
            _ => {}
        }
        message
    }
}
