//! Service configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration shared by the service and the lifecycle core.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Name used in logs and response metadata.
    pub service_name: String,
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Bound on each network step: SSH connect, tunnel setup, client handshake.
    pub connect_timeout_secs: u64,
    /// Bound on the liveness probe run on cache hits.
    pub probe_timeout_ms: u64,
    /// Max connections per relational pool.
    pub max_connections: u32,
    /// SSH keepalive interval.
    pub ssh_keepalive_secs: u64,
    /// Capacity of the event broadcast channels.
    pub event_buffer: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "connection-service".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8081,
            connect_timeout_secs: 10,
            probe_timeout_ms: 2000,
            max_connections: 5,
            ssh_keepalive_secs: 30,
            event_buffer: 64,
        }
    }
}

impl AppConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn load_with_service(service: &str) -> Self {
        let defaults = Self::default();
        Self {
            service_name: service.to_string(),
            host: env_or("SERVER_HOST", defaults.host),
            port: env_or("SERVER_PORT", defaults.port),
            connect_timeout_secs: env_or("CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            probe_timeout_ms: env_or("PROBE_TIMEOUT_MS", defaults.probe_timeout_ms),
            max_connections: env_or("MAX_CONNECTIONS", defaults.max_connections),
            ssh_keepalive_secs: env_or("SSH_KEEPALIVE_SECS", defaults.ssh_keepalive_secs),
            event_buffer: env_or("EVENT_BUFFER", defaults.event_buffer).max(1),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ssh_keepalive(&self) -> Duration {
        Duration::from_secs(self.ssh_keepalive_secs)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = raw, "invalid configuration value, using default");
            default
        }
    }
}
