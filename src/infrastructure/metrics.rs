//! Per-connection metrics collection
//!
//! Lock-free counters using atomic operations. Updated from the reader and
//! writer workers, exported as snapshots for pool statistics and status
//! queries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Connection metrics collector
///
/// Thread-safe counters updated by the connection workers.
/// Snapshots taken for status export.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// Dial attempts (initial connects and reconnects)
    connect_attempts: AtomicU64,
    /// Successful connects
    connects: AtomicU64,
    /// Observed disconnects (session teardowns)
    disconnects: AtomicU64,
    /// Successful reconnects
    reconnects: AtomicU64,
    /// Messages enqueued for sending
    messages_sent: AtomicU64,
    /// Messages received
    messages_received: AtomicU64,
    /// Bytes enqueued for sending
    bytes_sent: AtomicU64,
    /// Bytes received
    bytes_received: AtomicU64,
    /// Transport errors observed by workers
    errors: AtomicU64,
    /// Frames enqueued but not yet written (gauge)
    pending_outbound: AtomicU64,
    /// Last successful connect (Unix millis, 0 = never)
    last_connected_at: AtomicU64,
    /// Last disconnect (Unix millis, 0 = never)
    last_disconnected_at: AtomicU64,
}

/// Metrics snapshot for status export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub reconnects: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub pending_outbound: u64,
    pub last_connected_at: u64,
    pub last_disconnected_at: u64,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ConnectionMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.last_connected_at.store(unix_millis(), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.last_disconnected_at
            .store(unix_millis(), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound message at enqueue time
    #[inline]
    pub fn record_message_out(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.pending_outbound.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that the writer dequeued one frame
    #[inline]
    pub fn record_message_written(&self) {
        let mut current = self.pending_outbound.load(Ordering::Relaxed);
        while current > 0 {
            match self.pending_outbound.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    #[inline]
    pub fn record_message_in(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames enqueued but not yet written
    #[inline]
    pub fn pending_outbound(&self) -> u64 {
        self.pending_outbound.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Get current snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pending_outbound: self.pending_outbound.load(Ordering::Relaxed),
            last_connected_at: self.last_connected_at.load(Ordering::Relaxed),
            last_disconnected_at: self.last_disconnected_at.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = ConnectionMetrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connect_attempts, 0);
        assert_eq!(snapshot.messages_sent, 0);
        assert_eq!(snapshot.messages_received, 0);
        assert_eq!(snapshot.last_connected_at, 0);
    }

    #[test]
    fn test_record_messages() {
        let metrics = ConnectionMetrics::new();

        metrics.record_message_out(10);
        metrics.record_message_out(20);
        metrics.record_message_in(5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 30);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_received, 5);
        assert_eq!(snapshot.pending_outbound, 2);
    }

    #[test]
    fn test_pending_outbound_gauge() {
        let metrics = ConnectionMetrics::new();

        metrics.record_message_out(1);
        metrics.record_message_out(1);
        assert_eq!(metrics.pending_outbound(), 2);

        metrics.record_message_written();
        assert_eq!(metrics.pending_outbound(), 1);

        // Never underflows
        metrics.record_message_written();
        metrics.record_message_written();
        assert_eq!(metrics.pending_outbound(), 0);
    }

    #[test]
    fn test_connect_timestamps() {
        let metrics = ConnectionMetrics::new();

        metrics.record_connect_attempt();
        metrics.record_connected();
        metrics.record_disconnected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connect_attempts, 1);
        assert_eq!(snapshot.connects, 1);
        assert_eq!(snapshot.disconnects, 1);
        assert!(snapshot.last_connected_at > 0);
        assert!(snapshot.last_disconnected_at >= snapshot.last_connected_at);
    }
}
