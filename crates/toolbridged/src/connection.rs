use crate::error::BridgeError;
use crate::handle::{ConnHandle, ConnReceiver, ReadyState};
use crate::metrics::counters;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio::sync::SemaphorePermit;
use tokio::time::{interval, sleep, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use toolbridge_common::crypto;
use toolbridge_common::types::{close_code, close_reason, error_code, PROTOCOL_VERSION};
use toolbridge_common::{Identity, InboundMessage, OutboundMessage};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Outbound frames buffered per connection before sends start failing.
const OUTBOUND_QUEUE: usize = 256;

/// What the upgrade callback saw in the HTTP request.
#[derive(Debug)]
struct UpgradeInfo {
    token: Option<String>,
    user_agent: String,
}

static NO_UPGRADE_INFO: UpgradeInfo = UpgradeInfo {
    token: None,
    user_agent: String::new(),
};

/// Bearer token from the `Authorization` header, else the `token` query
/// parameter.
fn extract_token(request: &Request<()>) -> Option<String> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    request.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

fn extract_user_agent(request: &Request<()>) -> String {
    request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Atomically count a new connection from `ip`, or refuse it at the limit.
fn acquire_ip_slot(state: &Arc<ServerState>, ip: IpAddr) -> Option<IpGuard> {
    match state.ip_connections.entry(ip) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            if *entry.get() >= state.config.max_conns_ip {
                return None;
            }
            *entry.get_mut() += 1;
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(1);
        }
    }
    Some(IpGuard {
        state: state.clone(),
        ip,
    })
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason.to_string()),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!("failed to send close frame: {}", e);
    }
}

/// Reject an upgraded socket whose session token was not accepted.
async fn reject_unauthorized(ws_tx: &mut WsSink, err: &BridgeError) {
    let reply = OutboundMessage::error(error_code::UNAUTHORIZED, err.to_string());
    if let Ok(text) = reply.to_json() {
        if let Err(e) = ws_tx.send(Message::Text(text)).await {
            debug!("failed to send unauthorized error: {}", e);
        }
    }
    send_close(ws_tx, close_code::POLICY_VIOLATION, close_reason::UNAUTHORIZED).await;
}

/// Per-connection routing of validated companion messages.
pub(crate) struct Connection<'a> {
    state: &'a ServerState,
    handle: ConnHandle,
    identity: Identity,
    fingerprint: String,
}

impl<'a> Connection<'a> {
    pub(crate) fn new(
        state: &'a ServerState,
        handle: ConnHandle,
        identity: Identity,
        fingerprint: String,
    ) -> Self {
        Self {
            state,
            handle,
            identity,
            fingerprint,
        }
    }

    fn reply(&self, msg: &OutboundMessage) {
        if let Err(e) = self.handle.send(msg) {
            debug!(identity = %self.identity, conn_id = self.handle.id(), "reply dropped: {}", e);
        }
    }

    fn reject(&self, code: &str, metric: &'static str, reason: String) {
        counters::messages_rejected_total(metric);
        warn!(identity = %self.identity, conn_id = self.handle.id(), code, "{}", reason);
        self.reply(&OutboundMessage::error(code, reason));
    }

    fn fail_authentication(&self, close_with: &str, reason: String) {
        warn!(identity = %self.identity, conn_id = self.handle.id(), "{}", reason);
        self.reply(&OutboundMessage::error(error_code::CHALLENGE_FAILED, reason));
        if let Err(e) = self.handle.close(close_code::POLICY_VIOLATION, close_with) {
            debug!(conn_id = self.handle.id(), "close after failed challenge: {}", e);
        }
    }

    /// Route one text frame from the companion.
    pub(crate) fn process_message(&self, text: &str) {
        let msg = match InboundMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.reject(
                    error_code::INVALID_MESSAGE,
                    e.kind(),
                    format!("{} (field: {})", e, e.field()),
                );
                return;
            }
        };
        let registry = &self.state.registry;

        match msg {
            InboundMessage::Ping { .. } => {
                registry.update_last_ping(&self.handle);
                self.reply(&OutboundMessage::pong(crypto::unix_now_millis()));
            }
            InboundMessage::ChallengeResponse { response } => {
                self.on_challenge_response(&response);
            }
            InboundMessage::ToolResult(result) => {
                if !registry.is_challenge_verified(&self.handle) {
                    self.reject(
                        error_code::CHALLENGE_REQUIRED,
                        "challenge_required",
                        "tool_result before challenge verification".to_string(),
                    );
                    return;
                }
                let id = result.id.clone();
                if self.handle.pending().resolve(result) {
                    debug!(identity = %self.identity, id = %id, "tool result delivered");
                } else {
                    self.reject(
                        error_code::UNKNOWN_CORRELATION_ID,
                        "unknown_correlation_id",
                        format!("no tool call in flight with id `{}`", id),
                    );
                }
            }
            InboundMessage::ToolExecute(_) => {
                self.reject(
                    error_code::UNEXPECTED_MESSAGE,
                    "unexpected_message",
                    "tool_execute is only sent by the bridge".to_string(),
                );
            }
        }
    }

    fn on_challenge_response(&self, response: &str) {
        let registry = &self.state.registry;
        if registry.is_challenge_verified(&self.handle) {
            self.reject(
                error_code::UNEXPECTED_MESSAGE,
                "unexpected_message",
                "challenge already verified".to_string(),
            );
            return;
        }
        if let Err(e) = self.state.challenges.verify(&self.handle, response) {
            self.fail_authentication(close_reason::CHALLENGE_FAILED, e.to_string());
            return;
        }
        if !registry.verify_connection_fingerprint(&self.handle, &self.fingerprint) {
            counters::challenges_total("fingerprint_mismatch");
            self.fail_authentication(
                close_reason::FINGERPRINT_MISMATCH,
                BridgeError::FingerprintMismatch.to_string(),
            );
            return;
        }
        registry.mark_challenge_verified(&self.handle);
        self.reply(&OutboundMessage::challenge_verified(crypto::unix_now_millis()));
        info!(identity = %self.identity, conn_id = self.handle.id(), "challenge verified");
    }

    fn is_verified(&self) -> bool {
        self.state.registry.is_challenge_verified(&self.handle)
    }
}

/// Drive the select loop for a registered connection until either side
/// closes it.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    receiver: &mut ConnReceiver,
    conn: &Connection<'_>,
    mut permit: Option<SemaphorePermit<'_>>,
) -> Result<(), BridgeError> {
    let config = &conn.state.config;
    let mut ping_interval = interval(Duration::from_secs(config.ping_interval));
    let challenge_deadline = sleep(conn.state.challenges.window());
    tokio::pin!(challenge_deadline);
    let mut verified = false;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn.process_message(&text);
                        if !verified && conn.is_verified() {
                            verified = true;
                            permit.take();
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        conn.reject(
                            error_code::INVALID_MESSAGE,
                            "binary",
                            "binary frames are not accepted".to_string(),
                        );
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(BridgeError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(text) = receiver.frames.recv() => {
                ws_tx.send(Message::Text(text)).await?;
            }
            changed = receiver.close.changed() => {
                let request = receiver.close.borrow_and_update().clone();
                if changed.is_err() || request.is_some() {
                    // Flush replies queued ahead of the close.
                    while let Ok(text) = receiver.frames.try_recv() {
                        ws_tx.send(Message::Text(text)).await?;
                    }
                    if let Some(request) = request {
                        send_close(ws_tx, request.code, &request.reason).await;
                    }
                    return Ok(());
                }
            }
            () = &mut challenge_deadline, if !verified => {
                counters::challenges_total("timeout");
                conn.fail_authentication(
                    close_reason::CHALLENGE_FAILED,
                    "challenge not answered in time".to_string(),
                );
                // Re-arm far out; the close request now drives the loop.
                challenge_deadline.as_mut().reset(Instant::now() + Duration::from_secs(86_400));
            }
            _ = ping_interval.tick() => {
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

/// Serve one accepted TCP connection from upgrade to teardown.
///
/// # Errors
///
/// Returns an error if the upgrade fails, the client is over its per-IP
/// limit, the session token is rejected, or the transport fails.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), BridgeError> {
    // Held until the challenge is answered.
    let permit = state.pre_auth_semaphore.acquire().await.map_err(|_| {
        debug!("pre-auth semaphore closed");
        BridgeError::ConnectionClosed
    })?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message),
        max_frame_size: Some(state.config.max_message),
        ..WebSocketConfig::default()
    };

    let upgrade = Arc::new(OnceLock::new());
    let upgrade_cell = upgrade.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, mut resp: Response<()>| -> Result<Response<()>, ErrorResponse> {
            let _ = upgrade_cell.set(UpgradeInfo {
                token: extract_token(req),
                user_agent: extract_user_agent(req),
            });
            if let Some(protocols) = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
                if let Ok(proto_str) = protocols.to_str() {
                    if proto_str.split(',').map(str::trim).any(|p| p == PROTOCOL_VERSION) {
                        resp.headers_mut().insert(
                            header::SEC_WEBSOCKET_PROTOCOL,
                            HeaderValue::from_static(PROTOCOL_VERSION),
                        );
                    }
                }
            }
            Ok(resp)
        },
        Some(ws_config),
    )
    .await?;

    let client_ip = peer_addr.ip();
    let Some(_ip_guard) = acquire_ip_slot(&state, client_ip) else {
        debug!(ip = %client_ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(BridgeError::ConnectionClosed);
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let upgrade: &UpgradeInfo = upgrade.get().unwrap_or(&NO_UPGRADE_INFO);

    let session = match upgrade
        .token
        .as_deref()
        .ok_or_else(|| BridgeError::Unauthorized("missing session token".to_string()))
        .and_then(|token| state.verifier.verify(token))
    {
        Ok(session) => session,
        Err(e) => {
            warn!(ip = %client_ip, "rejecting connection: {}", e);
            reject_unauthorized(&mut ws_tx, &e).await;
            return Err(e);
        }
    };

    let fingerprint = crypto::device_fingerprint(&upgrade.user_agent, &client_ip.to_string());
    let (handle, mut receiver) = ConnHandle::new(OUTBOUND_QUEUE);
    handle.set_ready_state(ReadyState::Open);

    let registry = &state.registry;
    registry.register(session.identity.clone(), handle.clone(), Some(fingerprint.clone()));
    registry.set_jwt_expiry_timer(&handle, session.expires_at, None);

    let issued = state
        .challenges
        .issue(&handle, &session.identity, &session.session_id);
    let conn = Connection::new(&state, handle.clone(), session.identity.clone(), fingerprint);
    conn.reply(&issued.to_message());

    let result = run_message_loop(&mut ws_tx, &mut ws_rx, &mut receiver, &conn, Some(permit)).await;

    handle.set_ready_state(ReadyState::Closed);
    state.challenges.discard(&handle);
    registry.unregister(&session.identity, &handle);
    let failed = handle.pending().fail_all();
    if failed > 0 {
        warn!(identity = %session.identity, failed, "connection closed with tool calls in flight");
    }
    debug!(identity = %session.identity, conn_id = handle.id(), "connection torn down");

    result
}
