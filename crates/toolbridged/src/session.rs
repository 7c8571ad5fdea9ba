use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashSet;
use toolbridge_common::Identity;

/// An authenticated session presented at upgrade time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Identity the connection acts for.
    pub identity: Identity,
    /// Session the token was issued for; bound into the challenge response.
    pub session_id: String,
    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,
}

/// Turns a bearer token into a [`Session`].
pub trait SessionVerifier: Send + Sync {
    /// Validate `token`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Unauthorized`] or [`BridgeError::Jwt`] if the
    /// token is not acceptable.
    fn verify(&self, token: &str) -> Result<Session, BridgeError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    jti: Option<String>,
}

/// HS256 JWT verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::from(["exp".to_string(), "sub".to_string()]);
        validation.leeway = 0;
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl SessionVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Session, BridgeError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?.claims;
        if claims.sub.is_empty() {
            return Err(BridgeError::Unauthorized("empty subject".to_string()));
        }
        let session_id = claims
            .sid
            .or(claims.jti)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BridgeError::Unauthorized("token carries no session id".to_string()))?;
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| BridgeError::Unauthorized("exp out of range".to_string()))?;
        Ok(Session {
            identity: claims.sub,
            session_id,
            expires_at,
        })
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}
