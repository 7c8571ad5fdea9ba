use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the bridge daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "toolbridged")]
#[command(about = "WebSocket bridge delegating tool calls to companion clients")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "TOOLBRIDGE_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "TOOLBRIDGE_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "TOOLBRIDGE_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "TOOLBRIDGE_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "1048576", env = "TOOLBRIDGE_MAX_MESSAGE")]
    pub max_message: usize,
    /// HS256 secret used to verify session tokens.
    #[arg(long, env = "TOOLBRIDGE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,
    /// Seconds a companion has to answer the challenge.
    #[arg(long, default_value = "30", env = "TOOLBRIDGE_CHALLENGE_TIMEOUT")]
    pub challenge_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "TOOLBRIDGE_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Interval between stale-connection sweeps in seconds.
    #[arg(long, default_value = "300", env = "TOOLBRIDGE_SWEEP_INTERVAL")]
    pub sweep_interval: u64,
    /// Inactivity in seconds after which a connection is stale.
    #[arg(long, default_value = "3600", env = "TOOLBRIDGE_STALE_THRESHOLD")]
    pub stale_threshold: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_message: usize,
    /// Seconds a companion has to answer the challenge.
    pub challenge_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Interval between stale-connection sweeps in seconds.
    pub sweep_interval: u64,
    /// Inactivity in seconds after which a connection is stale.
    pub stale_threshold: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        const MAX_ALLOWED_MESSAGE: usize = 16 * 1024 * 1024;
        if self.max_message == 0 {
            return Err("max_message must be greater than 0".to_string());
        }
        if self.max_message > MAX_ALLOWED_MESSAGE {
            return Err(format!(
                "max_message exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_MESSAGE
            ));
        }

        if self.challenge_timeout == 0 {
            return Err("challenge_timeout must be greater than 0".to_string());
        }
        if self.challenge_timeout > 300 {
            return Err("challenge_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.sweep_interval == 0 {
            return Err("sweep_interval must be greater than 0".to_string());
        }
        if self.sweep_interval > 86_400 {
            return Err("sweep_interval exceeds reasonable limit (86400 seconds / 1 day)".to_string());
        }

        // A threshold below the ping interval would evict healthy clients.
        if self.stale_threshold <= self.ping_interval {
            return Err("stale_threshold must exceed ping_interval".to_string());
        }
        if self.stale_threshold > 7 * 86_400 {
            return Err("stale_threshold exceeds reasonable limit (7 days)".to_string());
        }
        Ok(())
    }

    /// Registry tuning derived from this configuration.
    #[must_use]
    pub const fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval),
            stale_threshold: Duration::from_secs(self.stale_threshold),
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_message: args.max_message,
            challenge_timeout: args.challenge_timeout,
            ping_interval: args.ping_interval,
            sweep_interval: args.sweep_interval,
            stale_threshold: args.stale_threshold,
        }
    }
}

/// Timing knobs of the connection registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Period of the stale-connection sweep.
    pub sweep_interval: Duration,
    /// Inactivity after which a connection is evicted.
    pub stale_threshold: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            stale_threshold: Duration::from_secs(3600),
        }
    }
}
