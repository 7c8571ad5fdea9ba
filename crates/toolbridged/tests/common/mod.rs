#![allow(dead_code)]

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use toolbridge_common::crypto;
use toolbridge_common::types::PROTOCOL_VERSION;
use toolbridged::config::ServerConfig;
use toolbridged::server::ServerState;
use toolbridged::session::JwtVerifier;

pub const SECRET: &[u8] = b"integration-test-secret-0123456789";
pub const USER_AGENT: &str = "toolbridge-test/1.0";

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        max_message: 1_048_576,
        challenge_timeout: 5,
        ping_interval: 30,
        sweep_interval: 300,
        stale_threshold: 3600,
    }
}

pub fn mint_token(identity: &str, session_id: &str, ttl_secs: i64) -> String {
    let claims = json!({
        "sub": identity,
        "sid": session_id,
        "exp": Utc::now().timestamp() + ttl_secs,
    });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub shutdown: watch::Sender<()>,
}

pub async fn start_server_with_config(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    configure(&mut config);
    let state = Arc::new(ServerState::new(config, Arc::new(JwtVerifier::new(SECRET))));
    let (shutdown, shutdown_rx) = watch::channel(());

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = toolbridged::run_with_shutdown(listener, state_clone, shutdown_rx).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        shutdown,
    }
}

pub async fn start_server() -> TestServer {
    start_server_with_config(|_| {}).await
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<WsStream>,
    pub identity: String,
    pub session_id: String,
}

impl TestClient {
    /// Open a socket with `token` but do not answer the challenge.
    pub async fn open(addr: &SocketAddr, token: Option<&str>) -> (Self, Option<String>) {
        let url = format!("ws://{addr}/ws");
        let mut req = url.into_client_request().unwrap();
        req.headers_mut()
            .insert("Sec-WebSocket-Protocol", PROTOCOL_VERSION.parse().unwrap());
        req.headers_mut()
            .insert("User-Agent", USER_AGENT.parse().unwrap());
        if let Some(token) = token {
            req.headers_mut()
                .insert("Authorization", format!("Bearer {token}").parse().unwrap());
        }
        let (ws, resp) = tokio_tungstenite::connect_async(req).await.unwrap();
        let proto = resp
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let (ws_tx, ws_rx) = ws.split();
        (
            Self {
                ws_tx,
                ws_rx,
                identity: String::new(),
                session_id: String::new(),
            },
            proto,
        )
    }

    /// Connect as `identity` and complete the challenge handshake.
    pub async fn connect(addr: &SocketAddr, identity: &str, session_id: &str) -> Self {
        let token = mint_token(identity, session_id, 3600);
        let mut client = Self::connect_unverified(addr, identity, session_id, &token).await;
        let challenge = client.expect_challenge().await;
        client.answer(&challenge).await;
        let reply = client.recv_json().await;
        assert_eq!(reply["type"], "challenge_verified", "got {reply}");
        client
    }

    pub async fn connect_unverified(
        addr: &SocketAddr,
        identity: &str,
        session_id: &str,
        token: &str,
    ) -> Self {
        let (mut client, _) = Self::open(addr, Some(token)).await;
        client.identity = identity.to_string();
        client.session_id = session_id.to_string();
        client
    }

    pub async fn expect_challenge(&mut self) -> String {
        let msg = self.recv_json().await;
        assert_eq!(msg["type"], "challenge", "got {msg}");
        assert!(msg["expiresIn"].as_u64().unwrap() > 0);
        msg["challenge"].as_str().unwrap().to_string()
    }

    pub async fn answer(&mut self, challenge: &str) {
        let response = crypto::challenge_response(challenge, &self.identity, &self.session_id);
        self.send_json(&json!({"type": "challenge_response", "response": response}))
            .await;
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_text(value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws_tx.send(Message::Text(text)).await.unwrap();
    }

    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Read until the server closes, skipping any text frames.
    pub async fn recv_close(&mut self, within: Duration) -> Option<CloseFrame<'static>> {
        tokio::time::timeout(within, async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(frame)) => return frame,
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
            None
        })
        .await
        .expect("timeout waiting for close")
    }
}
