//! Core type definitions and protocol constants for toolbridge.

/// The authenticated principal a connection is registered under.
pub type Identity = String;

/// Current WebSocket subprotocol identifier.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: &str = "toolbridge.v1";

/// Length of a hex-encoded challenge or challenge response (32 bytes).
pub const CHALLENGE_HEX_LEN: usize = 64;

/// Maximum length of a server or tool name.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of a tool-call correlation id.
pub const MAX_CORRELATION_ID_LEN: usize = 128;

/// WebSocket close codes used by the bridge.
pub mod close_code {
    /// Normal closure; used when a newer connection supersedes this one.
    pub const NORMAL: u16 = 1000;
    /// Policy violation; session expired, failed challenge, bad credentials.
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Close reasons attached to close frames.
pub mod close_reason {
    /// A newer connection for the same identity replaced this one.
    pub const SUPERSEDED: &str = "superseded";
    /// The session token reached its expiry.
    pub const SESSION_EXPIRED: &str = "session expired";
    /// The challenge response was missing, late, or wrong.
    pub const CHALLENGE_FAILED: &str = "challenge failed";
    /// The device fingerprint did not match the one captured at registration.
    pub const FINGERPRINT_MISMATCH: &str = "fingerprint mismatch";
    /// The session token was missing or invalid.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// Evicted by the stale connection sweep.
    pub const STALE: &str = "stale connection";
    /// The bridge is shutting down.
    pub const SHUTDOWN: &str = "server shutting down";
}

/// Stable codes carried in `error` messages.
pub mod error_code {
    /// The payload failed schema validation.
    pub const INVALID_MESSAGE: &str = "invalid_message";
    /// The message type is valid but not accepted in this direction or state.
    pub const UNEXPECTED_MESSAGE: &str = "unexpected_message";
    /// The connection must complete the challenge before this message.
    pub const CHALLENGE_REQUIRED: &str = "challenge_required";
    /// The challenge response did not verify.
    pub const CHALLENGE_FAILED: &str = "challenge_failed";
    /// A `tool_result` arrived for an id with no in-flight call.
    pub const UNKNOWN_CORRELATION_ID: &str = "unknown_correlation_id";
    /// Session token missing or rejected.
    pub const UNAUTHORIZED: &str = "unauthorized";
}
