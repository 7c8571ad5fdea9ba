use crate::handle::{ConnHandle, ConnId};
use crate::metrics::counters;
use crate::registry::Registry;
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use toolbridge_common::{crypto, Identity, OutboundMessage};
use tracing::{debug, warn};

/// Default validity window of an issued challenge.
pub const DEFAULT_CHALLENGE_WINDOW: Duration = Duration::from_secs(30);

/// Reasons a challenge response was not accepted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChallengeError {
    /// No challenge is outstanding for the connection.
    #[error("no challenge outstanding")]
    NotIssued,
    /// The challenge window elapsed before the response arrived.
    #[error("challenge expired")]
    Expired,
    /// The response does not match the expected digest.
    #[error("challenge response mismatch")]
    Mismatch,
}

/// A challenge handed to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChallenge {
    /// Hex challenge value.
    pub challenge: String,
    /// How long the connection has to answer.
    pub expires_in: Duration,
}

impl IssuedChallenge {
    /// Wire message announcing this challenge.
    #[must_use]
    pub fn to_message(&self) -> OutboundMessage {
        let millis = u64::try_from(self.expires_in.as_millis()).unwrap_or(u64::MAX);
        OutboundMessage::challenge(self.challenge.clone(), millis.max(1))
    }
}

#[derive(Debug)]
struct PendingChallenge {
    challenge: String,
    identity: Identity,
    session_id: String,
    issued_at: Instant,
}

/// Outstanding single-use challenges, one per connection.
#[derive(Debug)]
pub struct ChallengeStore {
    pending: DashMap<ConnId, PendingChallenge>,
    window: Duration,
}

impl ChallengeStore {
    /// Create a store whose challenges expire after `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            window,
        }
    }

    /// Validity window of issued challenges.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Issue a fresh challenge for a connection, replacing any outstanding one.
    pub fn issue(&self, handle: &ConnHandle, identity: &str, session_id: &str) -> IssuedChallenge {
        let challenge = crypto::generate_challenge();
        self.pending.insert(
            handle.id(),
            PendingChallenge {
                challenge: challenge.clone(),
                identity: identity.to_string(),
                session_id: session_id.to_string(),
                issued_at: Instant::now(),
            },
        );
        counters::challenges_total("issued");
        debug!(conn_id = handle.id(), "challenge issued");
        IssuedChallenge {
            challenge,
            expires_in: self.window,
        }
    }

    /// Check a response against the outstanding challenge. The challenge is
    /// consumed whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ChallengeError`] if no challenge is outstanding, it has
    /// expired, or the response does not match.
    pub fn verify(&self, handle: &ConnHandle, response: &str) -> Result<(), ChallengeError> {
        let Some((_, pending)) = self.pending.remove(&handle.id()) else {
            counters::challenges_total("not_issued");
            return Err(ChallengeError::NotIssued);
        };
        if pending.issued_at.elapsed() > self.window {
            counters::challenges_total("expired");
            return Err(ChallengeError::Expired);
        }
        if !crypto::verify_challenge_response(
            &pending.challenge,
            &pending.identity,
            &pending.session_id,
            response,
        ) {
            counters::challenges_total("mismatch");
            warn!(identity = %pending.identity, conn_id = handle.id(), "challenge response mismatch");
            return Err(ChallengeError::Mismatch);
        }
        counters::challenges_total("verified");
        Ok(())
    }

    /// Forget any outstanding challenge for a connection.
    pub fn discard(&self, handle: &ConnHandle) {
        self.pending.remove(&handle.id());
    }

    /// Number of outstanding challenges.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHALLENGE_WINDOW)
    }
}

impl Registry {
    /// Mark the challenge as completed for a connection. Idempotent.
    /// Returns `false` if the handle is not registered.
    pub fn mark_challenge_verified(&self, handle: &ConnHandle) -> bool {
        match self.lock().entries.get_mut(&handle.id()) {
            Some(entry) => {
                entry.meta.challenge_verified = true;
                true
            }
            None => false,
        }
    }

    /// Returns `true` if the connection completed the challenge.
    #[must_use]
    pub fn is_challenge_verified(&self, handle: &ConnHandle) -> bool {
        self.lock()
            .entries
            .get(&handle.id())
            .is_some_and(|entry| entry.meta.challenge_verified)
    }

    /// Compare a fingerprint against the one captured at registration.
    ///
    /// Returns `false` if no fingerprint was captured or the handle is not
    /// registered, and `true` only on an exact match.
    #[must_use]
    pub fn verify_connection_fingerprint(&self, handle: &ConnHandle, current: &str) -> bool {
        let inner = self.lock();
        let Some(stored) = inner
            .entries
            .get(&handle.id())
            .and_then(|entry| entry.meta.fingerprint.as_deref())
        else {
            return false;
        };
        crypto::digests_match(stored, current)
    }
}
