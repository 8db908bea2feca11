//! Configuration management for the transport
//!
//! Loads configuration from config.toml at startup. All values are
//! configurable to avoid hardcoded constants; durations are expressed in
//! milliseconds in the file and converted into the typed runtime configs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::transport::TransportConfig;
use crate::ws::connection::ConnectionConfig;
use crate::ws::pool::{LoadBalancingStrategy, PoolConfig};

/// Transport configuration file
///
/// Loaded from config.toml at startup. Sections map onto the typed configs
/// consumed by the connection, pool, and transport layers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionSection,

    /// Pool settings
    #[serde(default)]
    pub pool: PoolSection,

    /// Transport settings
    #[serde(default)]
    pub transport: TransportSection,
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionSection {
    /// Reconnect attempt ceiling (0 = unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// Initial reconnect backoff delay in milliseconds
    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,

    /// Maximum reconnect backoff delay in milliseconds
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Backoff multiplier applied per failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub reconnect_backoff_multiplier: f64,

    /// TCP dial timeout in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// WebSocket handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Read deadline in milliseconds (0 disables)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Per-frame write deadline in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Ping interval in milliseconds (0 disables the ping loop)
    #[serde(default = "default_ping_period_ms")]
    pub ping_period_ms: u64,

    /// Pong freshness window in milliseconds (0 disables the health loop)
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,

    /// Maximum inbound message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Socket read buffer size in bytes
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Socket write buffer size in bytes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// Outbound queue depth in frames
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Reserved for deflate middleware; not negotiated by the core
    #[serde(default)]
    pub enable_compression: bool,

    /// Extra handshake headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSection {
    /// Upstream WebSocket URLs
    #[serde(default)]
    pub urls: Vec<String>,

    /// Availability floor the health checker converges toward
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Hard ceiling on pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Member establishment timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Health checker period in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Continuous-unhealthy window before removal, in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Member selection strategy
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportSection {
    /// Encoded event size ceiling in bytes
    #[serde(default = "default_max_event_size")]
    pub max_event_size: usize,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 0,
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            reconnect_backoff_multiplier: default_backoff_multiplier(),
            dial_timeout_ms: default_dial_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            ping_period_ms: default_ping_period_ms(),
            pong_wait_ms: default_pong_wait_ms(),
            max_message_size: default_max_message_size(),
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            outbound_queue: default_outbound_queue(),
            enable_compression: false,
            headers: HashMap::new(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            strategy: LoadBalancingStrategy::default(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            max_event_size: default_max_event_size(),
        }
    }
}

fn default_initial_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    90_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_ping_period_ms() -> u64 {
    30_000
}

fn default_pong_wait_ms() -> u64 {
    60_000
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_write_buffer_size() -> usize {
    64 * 1024
}

fn default_outbound_queue() -> usize {
    256
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    4
}

fn default_connection_timeout_ms() -> u64 {
    15_000
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_event_size() -> usize {
    1024 * 1024
}

impl Config {
    /// Load configuration from config.toml file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => {
                let config: Config = toml::from_str(&contents)
                    .map_err(|e| ConfigError::ParseError(e.to_string()))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Connection template for pool members
    ///
    /// The URL field is filled in by the pool from its URL list.
    pub fn connection_template(&self) -> ConnectionConfig {
        let millis = std::time::Duration::from_millis;
        let c = &self.connection;
        ConnectionConfig {
            url: String::new(),
            max_reconnect_attempts: c.max_reconnect_attempts,
            initial_reconnect_delay: millis(c.initial_reconnect_delay_ms),
            max_reconnect_delay: millis(c.max_reconnect_delay_ms),
            reconnect_backoff_multiplier: c.reconnect_backoff_multiplier,
            dial_timeout: millis(c.dial_timeout_ms),
            handshake_timeout: millis(c.handshake_timeout_ms),
            read_timeout: millis(c.read_timeout_ms),
            write_timeout: millis(c.write_timeout_ms),
            ping_period: millis(c.ping_period_ms),
            pong_wait: millis(c.pong_wait_ms),
            max_message_size: c.max_message_size,
            read_buffer_size: c.read_buffer_size,
            write_buffer_size: c.write_buffer_size,
            outbound_queue: c.outbound_queue,
            enable_compression: c.enable_compression,
            headers: c.headers.clone(),
            rate_limiter: None,
            test_mode: false,
        }
    }

    /// Typed pool configuration
    pub fn pool_config(&self) -> PoolConfig {
        let millis = std::time::Duration::from_millis;
        let p = &self.pool;
        PoolConfig {
            urls: p.urls.clone(),
            min_connections: p.min_connections,
            max_connections: p.max_connections,
            connection_timeout: millis(p.connection_timeout_ms),
            health_check_interval: millis(p.health_check_interval_ms),
            idle_timeout: millis(p.idle_timeout_ms),
            strategy: p.strategy,
            connection_template: self.connection_template(),
        }
    }

    /// Typed transport configuration
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            pool: self.pool_config(),
            max_event_size: self.transport.max_event_size,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.ping_period_ms, 30_000);
        assert_eq!(config.connection.pong_wait_ms, 60_000);
        assert_eq!(config.pool.min_connections, 1);
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.transport.max_event_size, 1024 * 1024);
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            urls = ["ws://localhost:9001/ws"]
            min_connections = 2
            max_connections = 8
            strategy = "least_connections"

            [connection]
            ping_period_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.urls.len(), 1);
        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.strategy, LoadBalancingStrategy::LeastConnections);
        assert_eq!(config.connection.ping_period_ms, 5_000);
        // Untouched fields keep defaults
        assert_eq!(config.connection.pong_wait_ms, 60_000);
    }

    #[test]
    fn test_typed_conversion() {
        let mut config = Config::default();
        config.pool.urls = vec!["ws://localhost:9001/ws".to_string()];
        config.connection.dial_timeout_ms = 1_234;

        let pool = config.pool_config();
        assert_eq!(pool.urls.len(), 1);
        assert_eq!(pool.connection_template.dial_timeout, Duration::from_millis(1_234));
        assert!(pool.connection_template.url.is_empty());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let parsed: Result<Config, _> = toml::from_str("connection = 42");
        assert!(parsed.is_err());
    }
}
