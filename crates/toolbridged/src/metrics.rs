use crate::registry::{ConnectionStats, Registry};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Serve `/metrics`, `/health`, `/ready` and `/stats` on `addr`.
///
/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server
/// fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())))
        .route("/stats", get(move || stats_handler(registry.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

async fn stats_handler(registry: Arc<Registry>) -> Json<ConnectionStats> {
    Json(registry.connection_stats())
}

/// Connection count gauges.
pub mod gauges {
    /// Set the active connections gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_connections_active(count: usize) {
        metrics::gauge!("toolbridge_connections_active").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a challenge event with the given status label.
    pub fn challenges_total(status: &'static str) {
        metrics::counter!("toolbridge_challenges_total", "status" => status).increment(1);
    }

    /// Increment the superseded-connections counter.
    pub fn connections_superseded_total() {
        metrics::counter!("toolbridge_connections_superseded_total").increment(1);
    }

    /// Increment the expired-sessions counter.
    pub fn sessions_expired_total() {
        metrics::counter!("toolbridge_sessions_expired_total").increment(1);
    }

    /// Increment the stale-evictions counter.
    pub fn stale_evictions_total() {
        metrics::counter!("toolbridge_stale_evictions_total").increment(1);
    }

    /// Increment the rejected-messages counter with the given reason label.
    pub fn messages_rejected_total(reason: &'static str) {
        metrics::counter!("toolbridge_messages_rejected_total", "reason" => reason).increment(1);
    }

    /// Record a tool call with the given outcome label.
    pub fn tool_calls_total(outcome: &'static str) {
        metrics::counter!("toolbridge_tool_calls_total", "outcome" => outcome).increment(1);
    }
}
