//! JSON message schema and validation.
//!
//! Every message is a JSON object whose required `type` field selects one
//! variant of a closed union. Inbound messages ([`InboundMessage`]) and
//! outbound messages ([`OutboundMessage`]) use disjoint tag sets; a tag
//! presented at the wrong boundary is rejected exactly like an unknown tag.
//!
//! Validation fails closed: wrong field types, constraint violations and
//! unknown extra fields are all rejections. Each [`MessageError`] carries the
//! offending field path via [`MessageError::field`].

use crate::types::{CHALLENGE_HEX_LEN, MAX_CORRELATION_ID_LEN, MAX_NAME_LEN};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// `type` tag of a ping message.
pub const TYPE_PING: &str = "ping";
/// `type` tag of a challenge response.
pub const TYPE_CHALLENGE_RESPONSE: &str = "challenge_response";
/// `type` tag of a tool execution request.
pub const TYPE_TOOL_EXECUTE: &str = "tool_execute";
/// `type` tag of a tool execution result.
pub const TYPE_TOOL_RESULT: &str = "tool_result";
/// `type` tag of a pong message.
pub const TYPE_PONG: &str = "pong";
/// `type` tag of a challenge.
pub const TYPE_CHALLENGE: &str = "challenge";
/// `type` tag of a challenge verification acknowledgement.
pub const TYPE_CHALLENGE_VERIFIED: &str = "challenge_verified";
/// `type` tag of an error report.
pub const TYPE_ERROR: &str = "error";

/// A request to run one tool on the companion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecute {
    /// Caller-supplied correlation id echoed back in the matching result.
    pub id: String,
    /// Name of the tool server hosting the tool.
    pub server_name: String,
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Structured tool arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

/// The outcome of a tool execution, reported by the companion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    /// Correlation id of the originating [`ToolExecute`].
    pub id: String,
    /// Whether the tool ran successfully.
    pub success: bool,
    /// Tool output on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Messages accepted from the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Application-level keepalive.
    Ping {
        /// Sender clock in milliseconds since the Unix epoch.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    /// Answer to a previously issued challenge.
    ChallengeResponse {
        /// Lowercase hex digest, [`CHALLENGE_HEX_LEN`] characters.
        response: String,
    },
    /// Tool execution request.
    ToolExecute(ToolExecute),
    /// Tool execution result.
    ToolResult(ToolResult),
}

/// Messages emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Keepalive reply.
    Pong {
        /// Bridge clock in milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// Challenge the companion must answer.
    Challenge {
        /// Random hex challenge, [`CHALLENGE_HEX_LEN`] characters.
        challenge: String,
        /// Validity window in milliseconds.
        #[serde(rename = "expiresIn")]
        expires_in: u64,
    },
    /// The challenge was answered correctly.
    ChallengeVerified {
        /// Bridge clock in milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// A protocol-level error report.
    Error {
        /// Stable machine-readable code, see [`crate::types::error_code`].
        code: String,
        /// Seconds the peer should wait before retrying.
        #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
        /// Human-readable explanation.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Reasons a payload was rejected by the schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The payload is not JSON at all.
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    /// The payload is JSON but not an object.
    #[error("payload must be a JSON object")]
    NotAnObject,
    /// The `type` discriminator is absent or not a string.
    #[error("missing or non-string `type` field")]
    MissingType,
    /// The `type` discriminator names no variant accepted at this boundary.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    /// A field is missing, mistyped, or violates a constraint.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Path of the offending field.
        field: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl MessageError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Path of the field the rejection refers to; `$` means the whole payload.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Json(_) | Self::NotAnObject => "$",
            Self::MissingType | Self::UnknownType(_) => "type",
            Self::InvalidField { field, .. } => field,
        }
    }

    /// Short label suitable for a metrics dimension.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::NotAnObject => "not_object",
            Self::MissingType => "missing_type",
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidField { .. } => "invalid_field",
        }
    }
}

/// Field cursor over a message object. Every accessor removes the field,
/// so whatever remains at [`Fields::finish`] is an unknown field.
struct Fields {
    map: Map<String, Value>,
}

impl Fields {
    fn required(&mut self, name: &str) -> Result<Value, MessageError> {
        self.map
            .remove(name)
            .ok_or_else(|| MessageError::invalid(name, "required field is missing"))
    }

    fn required_str(&mut self, name: &str) -> Result<String, MessageError> {
        match self.required(name)? {
            Value::String(s) => Ok(s),
            _ => Err(MessageError::invalid(name, "expected a string")),
        }
    }

    fn optional_str(&mut self, name: &str) -> Result<Option<String>, MessageError> {
        match self.map.remove(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(MessageError::invalid(name, "expected a string")),
        }
    }

    fn required_u64(&mut self, name: &str) -> Result<u64, MessageError> {
        let value = self.required(name)?;
        value
            .as_u64()
            .ok_or_else(|| MessageError::invalid(name, "expected a non-negative integer"))
    }

    fn optional_u64(&mut self, name: &str) -> Result<Option<u64>, MessageError> {
        match self.map.remove(name) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| MessageError::invalid(name, "expected a non-negative integer")),
        }
    }

    fn required_bool(&mut self, name: &str) -> Result<bool, MessageError> {
        match self.required(name)? {
            Value::Bool(b) => Ok(b),
            _ => Err(MessageError::invalid(name, "expected a boolean")),
        }
    }

    fn optional_object(&mut self, name: &str) -> Result<Option<Map<String, Value>>, MessageError> {
        match self.map.remove(name) {
            None => Ok(None),
            Some(Value::Object(obj)) => Ok(Some(obj)),
            Some(_) => Err(MessageError::invalid(name, "expected an object")),
        }
    }

    fn optional_any(&mut self, name: &str) -> Option<Value> {
        self.map.remove(name)
    }

    fn finish(self) -> Result<(), MessageError> {
        match self.map.keys().next() {
            Some(extra) => Err(MessageError::invalid(extra, "unknown field")),
            None => Ok(()),
        }
    }
}

/// Splits a payload into its `type` tag and remaining fields.
fn split_tagged(value: Value) -> Result<(String, Fields), MessageError> {
    let Value::Object(mut map) = value else {
        return Err(MessageError::NotAnObject);
    };
    let Some(Value::String(tag)) = map.remove("type") else {
        return Err(MessageError::MissingType);
    };
    Ok((tag, Fields { map }))
}

fn parse_json(text: &str) -> Result<Value, MessageError> {
    serde_json::from_str(text).map_err(|e| MessageError::Json(e.to_string()))
}

fn check_hex(field: &str, value: &str) -> Result<(), MessageError> {
    if value.len() != CHALLENGE_HEX_LEN {
        return Err(MessageError::invalid(
            field,
            format!("expected {CHALLENGE_HEX_LEN} hex characters, got {}", value.len()),
        ));
    }
    if !value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(MessageError::invalid(field, "expected lowercase hex characters"));
    }
    Ok(())
}

fn check_name(field: &str, value: &str) -> Result<(), MessageError> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(MessageError::invalid(
            field,
            format!("length must be between 1 and {MAX_NAME_LEN}"),
        ));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(MessageError::invalid(
            field,
            "only letters, digits, '-' and '_' are allowed",
        ));
    }
    Ok(())
}

fn check_correlation_id(value: &str) -> Result<(), MessageError> {
    if value.is_empty() || value.len() > MAX_CORRELATION_ID_LEN {
        return Err(MessageError::invalid(
            "id",
            format!("length must be between 1 and {MAX_CORRELATION_ID_LEN}"),
        ));
    }
    Ok(())
}

impl InboundMessage {
    /// Parses and validates a JSON text payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] if the payload is not JSON, has no string
    /// `type`, names an unknown or outbound-only type, or violates the
    /// variant's field constraints.
    ///
    /// # Examples
    ///
    /// ```
    /// use toolbridge_common::message::InboundMessage;
    /// let msg = InboundMessage::parse(r#"{"type":"ping"}"#).unwrap();
    /// assert_eq!(msg, InboundMessage::Ping { timestamp: None });
    /// ```
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        Self::from_value(parse_json(text)?)
    }

    /// Validates an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// See [`InboundMessage::parse`].
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let (tag, mut fields) = split_tagged(value)?;
        let msg = match tag.as_str() {
            TYPE_PING => Self::Ping {
                timestamp: fields.optional_u64("timestamp")?,
            },
            TYPE_CHALLENGE_RESPONSE => {
                let response = fields.required_str("response")?;
                check_hex("response", &response)?;
                Self::ChallengeResponse { response }
            }
            TYPE_TOOL_EXECUTE => {
                let id = fields.required_str("id")?;
                check_correlation_id(&id)?;
                let server_name = fields.required_str("serverName")?;
                check_name("serverName", &server_name)?;
                let tool_name = fields.required_str("toolName")?;
                check_name("toolName", &tool_name)?;
                let args = fields.optional_object("args")?;
                Self::ToolExecute(ToolExecute {
                    id,
                    server_name,
                    tool_name,
                    args,
                })
            }
            TYPE_TOOL_RESULT => {
                let id = fields.required_str("id")?;
                check_correlation_id(&id)?;
                let success = fields.required_bool("success")?;
                let result = fields.optional_any("result");
                let error = fields.optional_str("error")?;
                Self::ToolResult(ToolResult {
                    id,
                    success,
                    result,
                    error,
                })
            }
            _ => return Err(MessageError::UnknownType(tag)),
        };
        fields.finish()?;
        Ok(msg)
    }

    /// Returns the wire `type` tag for this message.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Ping { .. } => TYPE_PING,
            Self::ChallengeResponse { .. } => TYPE_CHALLENGE_RESPONSE,
            Self::ToolExecute(_) => TYPE_TOOL_EXECUTE,
            Self::ToolResult(_) => TYPE_TOOL_RESULT,
        }
    }

    /// Serializes to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error only if a structured payload cannot be encoded.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl OutboundMessage {
    /// Builds a `pong` message.
    #[must_use]
    pub const fn pong(timestamp: u64) -> Self {
        Self::Pong { timestamp }
    }

    /// Builds a `challenge` message.
    #[must_use]
    pub fn challenge(challenge: impl Into<String>, expires_in_ms: u64) -> Self {
        Self::Challenge {
            challenge: challenge.into(),
            expires_in: expires_in_ms,
        }
    }

    /// Builds a `challenge_verified` message.
    #[must_use]
    pub const fn challenge_verified(timestamp: u64) -> Self {
        Self::ChallengeVerified { timestamp }
    }

    /// Builds an `error` message with a stable code and a reason.
    #[must_use]
    pub fn error(code: &str, reason: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            retry_after: None,
            reason: Some(reason.into()),
        }
    }

    /// Parses and validates a JSON text payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] on any schema violation, including
    /// inbound-only tags.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        Self::from_value(parse_json(text)?)
    }

    /// Validates an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// See [`OutboundMessage::parse`].
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let (tag, mut fields) = split_tagged(value)?;
        let msg = match tag.as_str() {
            TYPE_PONG => Self::Pong {
                timestamp: fields.required_u64("timestamp")?,
            },
            TYPE_CHALLENGE => {
                let challenge = fields.required_str("challenge")?;
                check_hex("challenge", &challenge)?;
                let expires_in = fields.required_u64("expiresIn")?;
                if expires_in == 0 {
                    return Err(MessageError::invalid("expiresIn", "must be positive"));
                }
                Self::Challenge {
                    challenge,
                    expires_in,
                }
            }
            TYPE_CHALLENGE_VERIFIED => Self::ChallengeVerified {
                timestamp: fields.required_u64("timestamp")?,
            },
            TYPE_ERROR => {
                let code = fields.required_str("code")?;
                if code.is_empty() {
                    return Err(MessageError::invalid("code", "must not be empty"));
                }
                Self::Error {
                    code,
                    retry_after: fields.optional_u64("retryAfter")?,
                    reason: fields.optional_str("reason")?,
                }
            }
            _ => return Err(MessageError::UnknownType(tag)),
        };
        fields.finish()?;
        Ok(msg)
    }

    /// Returns the wire `type` tag for this message.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Pong { .. } => TYPE_PONG,
            Self::Challenge { .. } => TYPE_CHALLENGE,
            Self::ChallengeVerified { .. } => TYPE_CHALLENGE_VERIFIED,
            Self::Error { .. } => TYPE_ERROR,
        }
    }

    /// Serializes to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error only if encoding fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
