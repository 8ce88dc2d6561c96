//! Centralized configuration for the bus client and broker.
//!
//! This module provides constants for socket discovery, framing limits,
//! and the timing of the client run loop.

use std::time::Duration;

/// Client-side bus configuration.
pub struct BusConfig;

impl BusConfig {
    pub const DEFAULT_SOCKET: &'static str = "/var/run/ubus/ubus.sock";
    pub const SOCKET_ENV_VAR: &'static str = "UBUS_SOCKET";

    // Framing
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB
    /// Socket frame limit: a hex-encoded message plus its JSON envelope.
    pub const MAX_FRAME_SIZE: usize = 2 * Self::MAX_MESSAGE_SIZE + 64 * 1024;
    pub const MAX_NAME_LEN: usize = 255;

    // Timing
    pub const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const LOOP_TICK: Duration = Duration::from_millis(100);
}

/// Broker daemon configuration.
pub struct BrokerConfig;

impl BrokerConfig {
    pub const MAX_CLIENTS: usize = 256;
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
}

/// Resolve the socket path to use for a connection.
///
/// An explicit path wins, then the `UBUS_SOCKET` environment variable, then
/// the system default.
pub fn resolve_socket_path(explicit: Option<&str>) -> String {
    resolve_with_env(explicit, std::env::var(BusConfig::SOCKET_ENV_VAR).ok())
}

fn resolve_with_env(explicit: Option<&str>, env: Option<String>) -> String {
    match (explicit, env) {
        (Some(path), _) => path.to_string(),
        (None, Some(path)) if !path.is_empty() => path,
        _ => BusConfig::DEFAULT_SOCKET.to_string(),
    }
}
