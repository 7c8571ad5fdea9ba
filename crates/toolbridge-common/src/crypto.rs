//! Challenge-response and fingerprint helpers for the connection handshake.
//!
//! The bridge issues a random 32-byte challenge. A legitimate session holder
//! answers with `SHA-256(challenge ‖ identity ‖ session_id)` as lowercase hex;
//! the session id never travels on the bridge socket, so a party that only
//! observed the challenge cannot produce the answer.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generates a fresh random challenge as 64 lowercase hex characters.
///
/// # Examples
///
/// ```
/// let challenge = toolbridge_common::crypto::generate_challenge();
/// assert_eq!(challenge.len(), 64);
/// ```
#[must_use]
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Computes the expected answer to `challenge` for a session.
///
/// # Examples
///
/// ```
/// use toolbridge_common::crypto;
///
/// let challenge = crypto::generate_challenge();
/// let answer = crypto::challenge_response(&challenge, "user-1", "session-1");
/// assert!(crypto::verify_challenge_response(&challenge, "user-1", "session-1", &answer));
/// ```
#[must_use]
pub fn challenge_response(challenge: &str, identity: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(identity.as_bytes());
    hasher.update(session_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Checks a submitted answer against the expected one in constant time.
#[must_use]
pub fn verify_challenge_response(
    challenge: &str,
    identity: &str,
    session_id: &str,
    response: &str,
) -> bool {
    let expected = challenge_response(challenge, identity, session_id);
    digests_match(&expected, response)
}

/// Derives a device fingerprint from client characteristics captured at
/// connection time.
#[must_use]
pub fn device_fingerprint(user_agent: &str, client_ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"|");
    hasher.update(client_ip.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares two hex digests without leaking where they differ.
///
/// Lengths are public, so a length mismatch returns early.
#[must_use]
pub fn digests_match(expected: &str, presented: &str) -> bool {
    if expected.len() != presented.len() {
        return false;
    }
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Returns the current Unix time in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
