use crate::gate::Unhealthy;
use thiserror::Error;

/// Errors that can occur during bridge operation.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The session token was missing or rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// JWT decoding or validation failed.
    #[error("invalid session token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    /// The fingerprint presented during the handshake did not match.
    #[error("device fingerprint mismatch")]
    FingerprintMismatch,
    /// The connection failed its pre-dispatch health check.
    #[error("connection unhealthy: {0}")]
    Unhealthy(#[from] Unhealthy),
    /// The outbound queue for a connection is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection task is gone or already closing.
    #[error("connection closed")]
    ConnectionClosed,
    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a delegated tool call, as seen by the caller.
///
/// An in-band `success: false` result is not an error; it is returned as a
/// normal [`toolbridge_common::ToolResult`].
#[derive(Error, Debug)]
pub enum ToolCallError {
    /// No live connection exists for the identity.
    #[error("no connection for identity")]
    NotConnected,
    /// The connection exists but failed the health check.
    #[error("connection unhealthy: {0}")]
    Unhealthy(#[from] Unhealthy),
    /// Another call with the same correlation id is still in flight.
    #[error("correlation id `{0}` already in flight")]
    DuplicateId(String),
    /// The request could not be queued on the connection.
    #[error("failed to send request: {0}")]
    Send(#[source] BridgeError),
    /// The connection dropped before any result arrived.
    #[error("connection lost before a result arrived")]
    ConnectionLost,
}

impl ToolCallError {
    /// Short label suitable for a metrics dimension.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Unhealthy(_) => "unhealthy",
            Self::DuplicateId(_) => "duplicate_id",
            Self::Send(_) => "send_failed",
            Self::ConnectionLost => "connection_lost",
        }
    }
}
