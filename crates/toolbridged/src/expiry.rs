//! Session-expiry deadlines.
//!
//! Each registered connection carries at most one one-shot timer. When it
//! fires the connection is closed with a policy-violation close. Every
//! teardown path (unregister, supersession, reaper eviction) drops the
//! registry entry, and dropping the entry aborts its timer task.

use crate::handle::ConnHandle;
use crate::metrics::counters;
use crate::registry::{ExpiryTimer, Registry};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use toolbridge_common::types::{close_code, close_reason};
use tracing::{debug, info, warn};

/// Hook invoked when a session deadline fires, before the connection closes.
/// The deadline is already cleared from the metadata when it runs.
pub type ExpiryCallback = Box<dyn FnOnce(&ConnHandle) + Send + 'static>;

/// Outcome of [`Registry::set_jwt_expiry_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryArm {
    /// A deadline is pending.
    Armed,
    /// The deadline had already passed; nothing was armed or closed.
    AlreadyExpired,
    /// The handle is not registered.
    NotRegistered,
}

impl Registry {
    /// Arm the session-expiry deadline for a connection, replacing any
    /// deadline already armed for it.
    ///
    /// A deadline in the past is logged and otherwise ignored; the
    /// connection is not closed.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn set_jwt_expiry_timer(
        self: &Arc<Self>,
        handle: &ConnHandle,
        expires_at: DateTime<Utc>,
        on_expiry: Option<ExpiryCallback>,
    ) -> ExpiryArm {
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let Some(entry) = inner.entries.get_mut(&handle.id()) else {
            warn!(conn_id = handle.id(), "expiry timer requested for unregistered connection");
            return ExpiryArm::NotRegistered;
        };
        entry.expiry = None;
        entry.meta.expires_at = None;

        let remaining = match (expires_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => {
                warn!(
                    conn_id = handle.id(),
                    identity = %entry.meta.identity,
                    %expires_at,
                    "session token already expired when arming timer"
                );
                return ExpiryArm::AlreadyExpired;
            }
        };

        let registry = Arc::downgrade(self);
        let target = handle.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(registry) = registry.upgrade() {
                registry.fire_expiry(&target, generation, on_expiry);
            }
        });

        entry.expiry = Some(ExpiryTimer {
            generation,
            task: Some(task),
        });
        entry.meta.expires_at = Some(expires_at);
        debug!(conn_id = handle.id(), %expires_at, "session expiry armed");
        ExpiryArm::Armed
    }

    /// Cancel the pending deadline for a connection. Returns `true` if one
    /// was pending.
    pub fn clear_jwt_expiry_timer(&self, handle: &ConnHandle) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(&handle.id()) else {
            return false;
        };
        entry.meta.expires_at = None;
        entry.expiry.take().is_some()
    }

    /// Returns `true` if a deadline is pending for the connection.
    #[must_use]
    pub fn has_pending_expiry(&self, handle: &ConnHandle) -> bool {
        self.lock()
            .entries
            .get(&handle.id())
            .is_some_and(|entry| entry.expiry.is_some())
    }

    /// Number of pending deadlines across all connections.
    #[must_use]
    pub fn pending_expiry_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.expiry.is_some())
            .count()
    }

    fn fire_expiry(&self, handle: &ConnHandle, generation: u64, on_expiry: Option<ExpiryCallback>) {
        let identity = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get_mut(&handle.id()) else {
                return;
            };
            if entry.expiry.as_ref().map(|t| t.generation) != Some(generation) {
                debug!(conn_id = handle.id(), "stale expiry timer ignored");
                return;
            }
            entry.meta.expires_at = None;
            if let Some(timer) = entry.expiry.take() {
                timer.into_fired();
            }
            entry.meta.identity.clone()
        };

        if let Some(callback) = on_expiry {
            callback(handle);
        }

        counters::sessions_expired_total();
        info!(identity = %identity, conn_id = handle.id(), "session expired, closing connection");
        if let Err(e) = handle.close(close_code::POLICY_VIOLATION, close_reason::SESSION_EXPIRED) {
            debug!(conn_id = handle.id(), "expired connection already gone: {}", e);
        }
    }
}
