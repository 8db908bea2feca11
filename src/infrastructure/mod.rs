//! Infrastructure - cold path only
//!
//! This module contains non-latency-critical code:
//! - Configuration management
//! - Logging setup
//! - Metrics collection
//! - Outbound rate limiting

pub mod config;
pub mod logging;
pub mod metrics;
pub mod rate_limit;

pub use config::Config;
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use rate_limit::{Admission, RateLimiter, TokenBucket};
