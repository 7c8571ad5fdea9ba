//! Toolbridge daemon: keeps one authenticated WebSocket per identity and
//! delegates tool calls to the companion on the other end.
//!
//! A companion connects with a session token, is registered under its
//! identity (superseding any older connection), and must answer a
//! challenge before tool calls are dispatched to it. Session expiry and
//! stale-connection sweeps close connections in the background.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Challenge issuance and verification.
pub mod challenge;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for bridge operations.
pub mod error;
/// Session-expiry deadlines per connection.
pub mod expiry;
/// Health gate and tool-call correlation.
pub mod gate;
/// Connection handles shared between the registry and socket tasks.
pub mod handle;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
mod reaper;
/// Identity-keyed connection registry.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;
/// Session token verification.
pub mod session;

pub use error::{BridgeError, ToolCallError};
pub use gate::{execute_tool, Unhealthy};
pub use handle::{ConnHandle, ReadyState};
pub use registry::{ConnectionMetadata, ConnectionStats, Registry};
pub use server::{run, run_with_shutdown, ServerState};
