//! Managed WebSocket connections and pooling

pub mod connection;
pub mod heartbeat;
pub mod pool;
pub mod session;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use heartbeat::{HeartbeatManager, HeartbeatState, HeartbeatStats};
pub use pool::{ConnectionPool, LoadBalancingStrategy, PoolConfig, PoolStats};
