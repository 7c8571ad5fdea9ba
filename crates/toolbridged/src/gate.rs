//! Pre-dispatch health gate and tool-call correlation.
//!
//! A tool call is only dispatched to a connection that is registered, has an
//! `OPEN` transport and has completed the challenge. Results are matched to
//! callers by the caller-supplied correlation id; several calls may be in
//! flight on one connection at once.

use crate::error::{BridgeError, ToolCallError};
use crate::handle::{ConnHandle, ReadyState};
use crate::metrics::counters;
use crate::registry::Registry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use toolbridge_common::{InboundMessage, ToolExecute, ToolResult};
use tracing::{debug, warn};

/// Why a connection failed the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Unhealthy {
    /// The handle has no registry entry.
    #[error("connection not registered")]
    NotRegistered,
    /// The transport is not `OPEN`.
    #[error("connection not open (state: {0})")]
    NotOpen(ReadyState),
    /// The challenge-response handshake has not completed.
    #[error("challenge not completed")]
    ChallengeNotCompleted,
}

impl Registry {
    /// Run the composite health check for a connection.
    ///
    /// # Errors
    ///
    /// Returns the first failing condition as an [`Unhealthy`] reason.
    pub fn check_connection_health(&self, handle: &ConnHandle) -> Result<(), Unhealthy> {
        let inner = self.lock();
        let entry = inner
            .entries
            .get(&handle.id())
            .ok_or(Unhealthy::NotRegistered)?;
        let state = handle.ready_state();
        if state != ReadyState::Open {
            return Err(Unhealthy::NotOpen(state));
        }
        if !entry.meta.challenge_verified {
            return Err(Unhealthy::ChallengeNotCompleted);
        }
        Ok(())
    }

    /// Strict form of [`Registry::check_connection_health`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Unhealthy`] carrying the failure reason.
    pub fn assert_connection_healthy(&self, handle: &ConnHandle) -> Result<(), BridgeError> {
        self.check_connection_health(handle)?;
        Ok(())
    }
}

/// Tool calls awaiting a result on one connection, keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, Waiter>>,
    next_ticket: AtomicU64,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<ToolResult>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start waiting for the result with correlation id `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolCallError::DuplicateId`] if a caller is already waiting
    /// on the same id.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<ToolResult>, ToolCallError> {
        self.register_ticketed(id).map(|(_, rx)| rx)
    }

    /// Like [`register`](Self::register), also returning the ticket that
    /// identifies this registration to [`cancel`](Self::cancel).
    fn register_ticketed(
        &self,
        id: &str,
    ) -> Result<(u64, oneshot::Receiver<ToolResult>), ToolCallError> {
        let mut calls = self.lock();
        if calls.get(id).is_some_and(|w| !w.tx.is_closed()) {
            return Err(ToolCallError::DuplicateId(id.to_string()));
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        calls.insert(id.to_string(), Waiter { ticket, tx });
        Ok((ticket, rx))
    }

    /// Deliver a result to the caller waiting on its id. Returns `false` if
    /// nobody is waiting for it.
    pub fn resolve(&self, result: ToolResult) -> bool {
        let Some(waiter) = self.lock().remove(&result.id) else {
            return false;
        };
        waiter.tx.send(result).is_ok()
    }

    /// Stop waiting on `id` for the registration holding `ticket`. A later
    /// caller that reused the id keeps its entry. Returns `true` if removed.
    fn cancel(&self, id: &str, ticket: u64) -> bool {
        let mut calls = self.lock();
        if calls.get(id).is_some_and(|w| w.ticket == ticket) {
            calls.remove(id);
            return true;
        }
        false
    }

    /// Drop every pending call; their callers observe a lost connection.
    /// Returns the number of calls failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    /// Number of calls in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no call is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes the pending entry if the caller stops waiting early.
struct CancelOnDrop<'a> {
    pending: &'a PendingCalls,
    id: &'a str,
    ticket: u64,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.cancel(self.id, self.ticket);
        }
    }
}

/// Dispatch `request` to the live connection for `identity` and wait for the
/// matching `tool_result`.
///
/// No timeout is applied here; wrap the future in
/// [`tokio::time::timeout`] to bound the wait. Dropping the future stops
/// waiting and frees the correlation id.
///
/// # Errors
///
/// Returns [`ToolCallError`] if there is no connection, it fails the health
/// check, the id is already in flight, the request cannot be queued, or the
/// connection drops before a result arrives. A result with `success: false`
/// is returned as `Ok`.
pub async fn execute_tool(
    registry: &Registry,
    identity: &str,
    request: ToolExecute,
) -> Result<ToolResult, ToolCallError> {
    let outcome = dispatch(registry, identity, request).await;
    let label = match &outcome {
        Ok(result) if result.success => "success",
        Ok(_) => "tool_error",
        Err(e) => e.label(),
    };
    counters::tool_calls_total(label);
    outcome
}

async fn dispatch(
    registry: &Registry,
    identity: &str,
    request: ToolExecute,
) -> Result<ToolResult, ToolCallError> {
    let handle = registry
        .get_connection(identity)
        .ok_or(ToolCallError::NotConnected)?;
    registry.check_connection_health(&handle)?;

    let id = request.id.clone();
    let pending = handle.pending();
    let (ticket, rx) = pending.register_ticketed(&id)?;
    let mut guard = CancelOnDrop {
        pending,
        id: &id,
        ticket,
        armed: true,
    };

    let frame = InboundMessage::ToolExecute(request)
        .to_json()
        .map_err(|e| ToolCallError::Send(e.into()))?;
    handle.send_text(frame).map_err(ToolCallError::Send)?;
    debug!(identity = %identity, conn_id = handle.id(), id = %id, "tool call dispatched");

    let result = rx.await.map_err(|_| {
        warn!(identity = %identity, conn_id = handle.id(), id = %id, "connection lost with tool call in flight");
        ToolCallError::ConnectionLost
    });
    guard.armed = false;
    result
}
