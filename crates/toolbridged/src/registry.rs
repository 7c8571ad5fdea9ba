use crate::config::RegistryConfig;
use crate::handle::{ConnHandle, ConnId};
use crate::metrics::{counters, gauges};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toolbridge_common::types::{close_code, close_reason};
use toolbridge_common::Identity;
use tracing::{debug, info, warn};

/// Per-connection record kept alongside the identity routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Identity the connection is registered under.
    pub identity: Identity,
    /// Wall-clock registration time.
    pub connected_at: DateTime<Utc>,
    /// Wall-clock time of the last application-level ping.
    pub last_ping: Option<DateTime<Utc>>,
    /// Device fingerprint captured at registration.
    pub fingerprint: Option<String>,
    /// Whether the challenge-response handshake completed.
    pub challenge_verified: bool,
    /// Deadline of the armed session-expiry timer, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Monotonic time of the latest activity (registration or ping).
    pub(crate) last_activity: Instant,
}

/// Armed session-expiry deadline. Dropping it cancels the timer task.
#[derive(Debug)]
pub(crate) struct ExpiryTimer {
    pub(crate) generation: u64,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl ExpiryTimer {
    /// Release the bookkeeping from inside the firing task without aborting it.
    pub(crate) fn into_fired(mut self) {
        self.task.take();
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) handle: ConnHandle,
    pub(crate) meta: ConnectionMetadata,
    pub(crate) expiry: Option<ExpiryTimer>,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    /// Identity → live connection.
    pub(crate) connections: HashMap<Identity, ConnHandle>,
    /// Connection → metadata, keyed by handle rather than identity.
    pub(crate) entries: HashMap<ConnId, Entry>,
    pub(crate) next_generation: u64,
}

/// Snapshot of registry occupancy for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Number of identities with a live connection.
    pub total_connections: usize,
    /// Number of metadata records.
    pub metadata_entries: usize,
    /// Registration time of the oldest connection.
    pub oldest_connection: Option<DateTime<Utc>>,
    /// Registration time of the newest connection.
    pub newest_connection: Option<DateTime<Utc>>,
}

/// Identity → connection registry with per-connection metadata.
///
/// Both maps sit behind one mutex so every operation is atomic with respect
/// to the others; no operation suspends while holding it. The expiry
/// scheduler ([`crate::expiry`]), the reaper ([`crate::reaper`]), the
/// challenge flags ([`crate::challenge`]) and the health gate
/// ([`crate::gate`]) extend this type.
#[derive(Debug)]
pub struct Registry {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) sweeper: Mutex<Option<JoinHandle<()>>>,
    pub(crate) config: RegistryConfig,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sweeper: Mutex::new(None),
            config,
        }
    }

    /// Registry configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handle` as the live connection for `identity`.
    ///
    /// An open connection already registered for the identity is closed with
    /// the superseded reason; its metadata and expiry timer are discarded.
    /// Returns the superseded handle, if any.
    pub fn register(
        &self,
        identity: impl Into<Identity>,
        handle: ConnHandle,
        fingerprint: Option<String>,
    ) -> Option<ConnHandle> {
        let identity = identity.into();
        let mut inner = self.lock();

        let superseded = inner
            .connections
            .insert(identity.clone(), handle.clone())
            .filter(|old| old != &handle);

        if let Some(old) = &superseded {
            inner.entries.remove(&old.id());
            if old.is_open() {
                if let Err(e) = old.close(close_code::NORMAL, close_reason::SUPERSEDED) {
                    debug!(conn_id = old.id(), "superseded connection already gone: {}", e);
                }
            }
            counters::connections_superseded_total();
            info!(identity = %identity, old = old.id(), new = handle.id(), "connection superseded");
        } else {
            info!(identity = %identity, conn_id = handle.id(), "connection registered");
        }

        let now = Instant::now();
        inner.entries.insert(
            handle.id(),
            Entry {
                handle: handle.clone(),
                meta: ConnectionMetadata {
                    identity,
                    connected_at: Utc::now(),
                    last_ping: None,
                    fingerprint,
                    challenge_verified: false,
                    expires_at: None,
                    last_activity: now,
                },
                expiry: None,
            },
        );
        gauges::set_connections_active(inner.connections.len());
        superseded
    }

    /// Remove `handle` for `identity`.
    ///
    /// The identity mapping is only removed if `handle` is still the active
    /// connection for it, so a late close event from a replaced connection
    /// cannot evict its successor. The metadata (and expiry timer) for
    /// `handle` is always removed. Returns `true` if the mapping was removed.
    pub fn unregister(&self, identity: &str, handle: &ConnHandle) -> bool {
        let mut inner = self.lock();
        let is_active = inner
            .connections
            .get(identity)
            .is_some_and(|current| current == handle);
        if is_active {
            inner.connections.remove(identity);
        } else {
            debug!(identity = %identity, conn_id = handle.id(), "unregister of inactive handle");
        }
        inner.entries.remove(&handle.id());
        gauges::set_connections_active(inner.connections.len());
        is_active
    }

    /// Look up the live connection for an identity.
    #[must_use]
    pub fn get_connection(&self, identity: &str) -> Option<ConnHandle> {
        self.lock().connections.get(identity).cloned()
    }

    /// Snapshot of every live identity and its connection.
    #[must_use]
    pub fn connections(&self) -> Vec<(Identity, ConnHandle)> {
        self.lock()
            .connections
            .iter()
            .map(|(identity, handle)| (identity.clone(), handle.clone()))
            .collect()
    }

    /// Refresh the activity time of a connection. Returns `false` if the
    /// handle is not registered.
    pub fn update_last_ping(&self, handle: &ConnHandle) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(&handle.id()) {
            Some(entry) => {
                entry.meta.last_ping = Some(Utc::now());
                entry.meta.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Metadata snapshot for a connection.
    #[must_use]
    pub fn connection_metadata(&self, handle: &ConnHandle) -> Option<ConnectionMetadata> {
        self.lock()
            .entries
            .get(&handle.id())
            .map(|entry| entry.meta.clone())
    }

    /// Number of identities with a live connection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    /// Returns `true` if no identity has a live connection.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    /// Occupancy snapshot for dashboards.
    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        let inner = self.lock();
        let oldest = inner.entries.values().map(|e| e.meta.connected_at).min();
        let newest = inner.entries.values().map(|e| e.meta.connected_at).max();
        ConnectionStats {
            total_connections: inner.connections.len(),
            metadata_entries: inner.entries.len(),
            oldest_connection: oldest,
            newest_connection: newest,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(task) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !inner.entries.is_empty() {
            warn!(entries = inner.entries.len(), "registry dropped with live entries");
        }
    }
}
