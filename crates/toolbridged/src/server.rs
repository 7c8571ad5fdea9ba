use crate::challenge::ChallengeStore;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::BridgeError;
use crate::registry::Registry;
use crate::session::SessionVerifier;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use toolbridge_common::types::{close_code, close_reason};
use tracing::{error, info, warn};

/// Maximum number of sockets that have not yet answered their challenge.
pub const MAX_PRE_AUTH_CONNECTIONS: usize = 1000;

/// Shared state for the bridge server.
pub struct ServerState {
    /// Identity → connection registry.
    pub registry: Arc<Registry>,
    /// Outstanding challenges per connection.
    pub challenges: ChallengeStore,
    /// Validates session tokens presented at upgrade time.
    pub verifier: Arc<dyn SessionVerifier>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Number of accepted sockets still being served.
    pub active_connections: AtomicUsize,
    /// Semaphore to limit sockets that have not completed the challenge.
    pub pre_auth_semaphore: Semaphore,
}

impl ServerState {
    /// Build server state from configuration and a session verifier.
    #[must_use]
    pub fn new(config: ServerConfig, verifier: Arc<dyn SessionVerifier>) -> Self {
        Self {
            registry: Arc::new(Registry::new(config.registry())),
            challenges: ChallengeStore::new(Duration::from_secs(config.challenge_timeout)),
            verifier,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            pre_auth_semaphore: Semaphore::new(MAX_PRE_AUTH_CONNECTIONS),
            config,
        }
    }
}

/// Releases a global connection slot when the connection task ends.
struct ConnectionSlot(Arc<ServerState>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), BridgeError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// The stale-connection sweep runs for as long as the loop does. When a
/// value is sent on the channel or its sender is dropped, the loop stops
/// accepting, asks every registered connection to close, and waits for
/// in-flight connections to finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), BridgeError> {
    let local_addr = listener.local_addr().map_err(BridgeError::Io)?;
    info!("server listening on {}", local_addr);
    let task_tracker = Arc::new(tokio::sync::Notify::new());

    state.registry.start_cleanup_interval();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let active = state.active_connections.fetch_add(1, Ordering::AcqRel);
                        if active >= state.config.max_conns {
                            state.active_connections.fetch_sub(1, Ordering::AcqRel);
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let slot = ConnectionSlot(Arc::clone(&state));
                        let state = Arc::clone(&state);
                        let tracker = task_tracker.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                            drop(slot);
                            tracker.notify_one();
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!(
                    "shutdown signal received, draining {} connections",
                    state.active_connections.load(Ordering::Acquire)
                );
                break;
            }
        }
    }

    for (identity, handle) in state.registry.connections() {
        if let Err(e) = handle.close(close_code::NORMAL, close_reason::SHUTDOWN) {
            tracing::debug!(identity = %identity, "close on shutdown failed: {}", e);
        }
    }

    // Wait for in-flight connections to finish (with timeout)
    let drain_timeout = Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while state.active_connections.load(Ordering::Acquire) > 0 {
        if tokio::time::timeout_at(deadline, task_tracker.notified())
            .await
            .is_err()
        {
            warn!(
                "drain timeout reached with {} connections still active",
                state.active_connections.load(Ordering::Acquire)
            );
            break;
        }
    }

    state.registry.stop_cleanup_interval();
    info!("server shut down gracefully");
    Ok(())
}
