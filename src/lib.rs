//! Concurrent WebSocket connection fabric
//!
//! Carries a framed event stream between an application and one or more
//! remote WebSocket servers: managed connections with reconnection and
//! heartbeats, a load-balanced pool over multiple upstream URLs, and an
//! event publish/subscribe transport on top.

pub mod infrastructure;
pub mod transport;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use infrastructure::config::Config;
pub use transport::codec::{Event, EventCodec, JsonEventCodec};
pub use transport::{Transport, TransportConfig, TransportStats};
pub use ws::connection::{Connection, ConnectionConfig, ConnectionState};
pub use ws::heartbeat::{HeartbeatManager, HeartbeatStats};
pub use ws::pool::{ConnectionPool, LoadBalancingStrategy, PoolConfig, PoolStats};

use thiserror::Error;

/// Main error type for the connection fabric
#[derive(Error, Debug)]
pub enum WsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Operation {operation} invalid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ws::connection::ConnectionState,
    },

    #[error("Rate limited")]
    RateLimited,

    #[error("Outbound queue full")]
    Backpressure,

    #[error("No connections in pool")]
    NoConnection,

    #[error("No healthy connections in pool")]
    NoHealthyConnection,

    #[error("Event of {size} bytes exceeds limit of {limit} bytes")]
    EventTooLarge { size: usize, limit: usize },

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("No handler {handler_id} registered for event type {event_type:?}")]
    HandlerNotFound { event_type: String, handler_id: u64 },

    #[error("Event type must not be empty")]
    EmptyEventType,

    #[error("Unknown subscription: {0}")]
    SubscriptionNotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, WsError>;
