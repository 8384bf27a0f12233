#![allow(dead_code)]

use cord_auth::{MemoryStore, RefreshTask};
use cord_server::config::{AuthModeSetting, Config};
use cord_server::{build_app, AppState, Services};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub http: reqwest::Client,
    _key_refresh: Option<RefreshTask>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/api/ws?token={}", self.addr, token)
    }
}

pub fn local_config() -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.auth.jwt_secret = Some("integration-secret".to_string());
    config
}

pub fn federated_config(authority: SocketAddr) -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.auth.mode = AuthModeSetting::Federated;
    config.auth.authority_url = Some(format!("http://{authority}"));
    config
}

pub async fn spawn_server(config: Config) -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let services = Services::start(config, store.clone())
        .await
        .expect("start services");
    let app = build_app(services.state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestServer {
        addr,
        state: services.state,
        store,
        http: reqwest::Client::new(),
        _key_refresh: services.key_refresh,
    }
}

/// Register a user and return the `data` object of the response.
pub async fn register(server: &TestServer, username: &str) -> Value {
    let response = server
        .http
        .post(server.url("/api/auth/register"))
        .json(&json!({
            "email": format!("{username}@example.test"),
            "username": username,
            "displayName": username.to_uppercase(),
            "password": format!("{username}-password"),
        }))
        .send()
        .await
        .expect("register request");
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.expect("register body");
    body["data"].clone()
}

pub async fn connect(server: &TestServer, token: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url(token))
        .await
        .expect("websocket connect");
    ws
}

pub async fn send_event(ws: &mut Ws, event: &str, data: Value) {
    let text = json!({ "event": event, "data": data }).to_string();
    ws.send(Message::Text(text)).await.expect("send event");
}

/// Next JSON event, skipping control frames.
pub async fn next_event(ws: &mut Ws) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).expect("json event");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected an event, got {other:?}"),
            }
        }
    })
    .await
    .expect("event within deadline")
}

/// Assert nothing but control frames arrives for a short while.
pub async fn expect_silence(ws: &mut Ws) {
    let quiet = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "unexpected message: {quiet:?}");
}

/// Poll until `channel` has `expected` subscribers.
pub async fn wait_for_subscribers(server: &TestServer, channel: &str, expected: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            let count = server
                .state
                .hub
                .subscriber_count(channel)
                .await
                .expect("hub running");
            if count == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count reached");
}
