//! Heartbeat for connection keep-alive
//!
//! Drives periodic pings through the parent connection, watches pong
//! freshness, and maintains a lock-free health signal plus RTT statistics.
//! Persistent failure asks the parent to reconnect; the manager itself never
//! returns errors.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Consecutive missed pongs before the manager asks for a reconnect.
/// The health flag itself flips on the first missed pong.
const MISSED_PONG_RECONNECT_THRESHOLD: u32 = 5;

/// Ping writes never hold the session lock longer than this
const MAX_PING_WRITE_BUDGET: Duration = Duration::from_secs(1);

/// Shutdown wait for the ping and health loops
const STOP_BUDGET: Duration = Duration::from_millis(200);
const STOP_BUDGET_TEST_MODE: Duration = Duration::from_millis(50);

/// What the heartbeat needs from its owning connection
///
/// The manager holds a non-owning reference; the connection stops the
/// manager before tearing down, so the reference is never used after.
pub(crate) trait HeartbeatParent: Send + Sync {
    fn parent_id(&self) -> String;
    fn parent_connected(&self) -> bool;
    fn write_ping(&self, budget: Duration) -> BoxFuture<'_, Result<()>>;
    fn request_reconnect(&self, reason: &'static str);
}

/// Lifecycle state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeartbeatState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl HeartbeatState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Heartbeat statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub state: HeartbeatState,
    pub healthy: bool,
    pub missed_pongs: u32,
    pub time_since_last_pong: Duration,
    pub avg_rtt: Duration,
    pub min_rtt: Option<Duration>,
    pub max_rtt: Option<Duration>,
    pub rtt_samples: u64,
    pub unhealthy_periods: u64,
}

/// Ping/pong driver attached 1:1 to a connection session
pub struct HeartbeatManager {
    ping_period: Duration,
    pong_wait: Duration,
    write_timeout: Duration,
    test_mode: bool,

    state: AtomicU8,
    /// Reference instant for the atomic timestamps below
    epoch: Instant,
    /// Micros since epoch, 0 = never
    last_ping_at: AtomicU64,
    last_pong_at: AtomicU64,
    missed_pongs: AtomicU32,
    healthy: AtomicBool,
    unhealthy_periods: AtomicU64,

    // RTT stats, exponential moving average with smoothing 1/8
    rtt_avg_us: AtomicU64,
    rtt_min_us: AtomicU64,
    rtt_max_us: AtomicU64,
    rtt_samples: AtomicU64,

    parent: RwLock<Option<Weak<dyn HeartbeatParent>>>,
    reset_notify: Notify,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("ping_period", &self.ping_period)
            .field("pong_wait", &self.pong_wait)
            .field("state", &self.state_value())
            .finish()
    }
}

impl HeartbeatManager {
    /// Create a new manager; loops are spawned by `start`
    pub(crate) fn new(
        ping_period: Duration,
        pong_wait: Duration,
        write_timeout: Duration,
        test_mode: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            ping_period,
            pong_wait,
            write_timeout,
            test_mode,
            state: AtomicU8::new(HeartbeatState::Stopped as u8),
            epoch: Instant::now(),
            last_ping_at: AtomicU64::new(0),
            last_pong_at: AtomicU64::new(0),
            missed_pongs: AtomicU32::new(0),
            healthy: AtomicBool::new(false),
            unhealthy_periods: AtomicU64::new(0),
            rtt_avg_us: AtomicU64::new(0),
            rtt_min_us: AtomicU64::new(u64::MAX),
            rtt_max_us: AtomicU64::new(0),
            rtt_samples: AtomicU64::new(0),
            parent: RwLock::new(None),
            reset_notify: Notify::new(),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Attach the owning connection
    pub(crate) fn bind(&self, parent: Weak<dyn HeartbeatParent>) {
        *self.parent.write() = Some(parent);
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn parent(&self) -> Option<Arc<dyn HeartbeatParent>> {
        self.parent.read().as_ref().and_then(Weak::upgrade)
    }

    fn state_value(&self) -> HeartbeatState {
        HeartbeatState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start the ping and health-check loops
    ///
    /// Valid only when the manager is `Stopped`; a second call is ignored.
    pub(crate) fn start(self: &Arc<Self>, cancel: &CancellationToken) {
        if self
            .state
            .compare_exchange(
                HeartbeatState::Stopped as u8,
                HeartbeatState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!("heartbeat start ignored, not stopped");
            return;
        }

        self.last_pong_at.store(self.now_us(), Ordering::Relaxed);
        self.missed_pongs.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);

        let token = cancel.child_token();
        let mut tasks = Vec::new();

        if !self.ping_period.is_zero() {
            let this = Arc::clone(self);
            let loop_token = token.clone();
            tasks.push(tokio::spawn(async move {
                this.ping_loop(loop_token).await;
            }));
        }
        if !self.pong_wait.is_zero() {
            let this = Arc::clone(self);
            let loop_token = token.clone();
            tasks.push(tokio::spawn(async move {
                this.health_loop(loop_token).await;
            }));
        }

        *self.cancel.lock() = Some(token);
        *self.tasks.lock() = tasks;
        self.state
            .store(HeartbeatState::Running as u8, Ordering::Release);
    }

    /// Two-phase shutdown: cancel, short bounded wait, then force Stopped
    pub(crate) async fn stop(&self) {
        let from_running = self.state.compare_exchange(
            HeartbeatState::Running as u8,
            HeartbeatState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if from_running.is_err()
            && self
                .state
                .compare_exchange(
                    HeartbeatState::Starting as u8,
                    HeartbeatState::Stopping as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return;
        }

        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }

        let budget = if self.test_mode {
            STOP_BUDGET_TEST_MODE
        } else {
            STOP_BUDGET
        };
        let deadline = Instant::now() + budget;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                // The loop observes its token on the next poll; detach it
                tracing::debug!("heartbeat loop did not exit within stop budget");
            }
        }

        self.state
            .store(HeartbeatState::Stopped as u8, Ordering::Release);
    }

    /// Record a pong observed by the parent's reader
    pub(crate) fn on_pong(&self) {
        let now = self.now_us();
        self.last_pong_at.store(now, Ordering::Relaxed);
        self.missed_pongs.store(0, Ordering::Relaxed);
        if !self.healthy.swap(true, Ordering::Relaxed) {
            tracing::debug!("heartbeat healthy again");
        }

        let pinged_at = self.last_ping_at.load(Ordering::Relaxed);
        if pinged_at > 0 && now >= pinged_at {
            self.record_rtt(now - pinged_at);
        }
    }

    fn record_rtt(&self, sample_us: u64) {
        let samples = self.rtt_samples.fetch_add(1, Ordering::Relaxed);
        if samples == 0 {
            self.rtt_avg_us.store(sample_us, Ordering::Relaxed);
        } else {
            let avg = self.rtt_avg_us.load(Ordering::Relaxed) as i64;
            let next = avg + (sample_us as i64 - avg) / 8;
            self.rtt_avg_us.store(next.max(0) as u64, Ordering::Relaxed);
        }
        self.rtt_min_us.fetch_min(sample_us, Ordering::Relaxed);
        self.rtt_max_us.fetch_max(sample_us, Ordering::Relaxed);
    }

    /// Ask the ping loop to reschedule immediately
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Fresh pong within the wait window and no write failures
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn missed_pong_count(&self) -> u32 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> HeartbeatState {
        self.state_value()
    }

    fn time_since_last_pong(&self) -> Duration {
        let last = self.last_pong_at.load(Ordering::Relaxed);
        if last == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.now_us().saturating_sub(last))
    }

    /// Scalar health in [0, 1]: 1.0 on a fresh pong, linearly down to 0.0
    /// at `pong_wait`, and 0.0 whenever the health flag is down
    pub fn connection_health(&self) -> f64 {
        if !self.is_healthy() {
            return 0.0;
        }
        if self.pong_wait.is_zero() {
            return 1.0;
        }
        let elapsed = self.time_since_last_pong().as_secs_f64();
        (1.0 - elapsed / self.pong_wait.as_secs_f64()).clamp(0.0, 1.0)
    }

    pub fn stats(&self) -> HeartbeatStats {
        let samples = self.rtt_samples.load(Ordering::Relaxed);
        let min = self.rtt_min_us.load(Ordering::Relaxed);
        let max = self.rtt_max_us.load(Ordering::Relaxed);
        HeartbeatStats {
            state: self.state_value(),
            healthy: self.is_healthy(),
            missed_pongs: self.missed_pong_count(),
            time_since_last_pong: self.time_since_last_pong(),
            avg_rtt: Duration::from_micros(self.rtt_avg_us.load(Ordering::Relaxed)),
            min_rtt: (samples > 0).then(|| Duration::from_micros(min)),
            max_rtt: (samples > 0).then(|| Duration::from_micros(max)),
            rtt_samples: samples,
            unhealthy_periods: self.unhealthy_periods.load(Ordering::Relaxed),
        }
    }

    async fn ping_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.ping_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.reset_notify.notified() => {
                    ticker = interval(self.ping_period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    self.ping_once().await;
                }
                _ = ticker.tick() => {
                    self.ping_once().await;
                }
            }
        }
    }

    async fn ping_once(&self) {
        let Some(parent) = self.parent() else {
            return;
        };
        if !parent.parent_connected() {
            return;
        }

        let budget = if self.write_timeout.is_zero() {
            MAX_PING_WRITE_BUDGET
        } else {
            self.write_timeout.min(MAX_PING_WRITE_BUDGET)
        };

        match parent.write_ping(budget).await {
            Ok(()) => {
                self.last_ping_at.store(self.now_us(), Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(connection = %parent.parent_id(), error = %e, "ping write failed");
                if self.healthy.swap(false, Ordering::Relaxed) {
                    self.unhealthy_periods.fetch_add(1, Ordering::Relaxed);
                }
                if parent.parent_connected() {
                    parent.request_reconnect("ping write failed");
                }
            }
        }
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.pong_wait / 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_freshness(),
            }
        }
    }

    fn check_freshness(&self) {
        let elapsed = self.time_since_last_pong();
        if elapsed > self.pong_wait {
            let missed = self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1;
            if self.healthy.swap(false, Ordering::Relaxed) {
                self.unhealthy_periods.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "pong overdue, marking unhealthy"
                );
            }
            if missed >= MISSED_PONG_RECONNECT_THRESHOLD {
                if let Some(parent) = self.parent() {
                    if parent.parent_connected() {
                        parent.request_reconnect("missed pongs");
                    }
                }
            }
        } else if !self.healthy.swap(true, Ordering::Relaxed) {
            // A pong arrived since the last check
            self.missed_pongs.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TestParent {
        connected: AtomicBool,
        ping_ok: AtomicBool,
        pings: AtomicUsize,
        reconnects: AtomicUsize,
    }

    impl TestParent {
        fn connected() -> Arc<Self> {
            let parent = Arc::new(Self::default());
            parent.connected.store(true, Ordering::Relaxed);
            parent.ping_ok.store(true, Ordering::Relaxed);
            parent
        }
    }

    impl HeartbeatParent for TestParent {
        fn parent_id(&self) -> String {
            "test".to_string()
        }

        fn parent_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        fn write_ping(&self, _budget: Duration) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.pings.fetch_add(1, Ordering::Relaxed);
                if self.ping_ok.load(Ordering::Relaxed) {
                    Ok(())
                } else {
                    Err(crate::WsError::Write("boom".to_string()))
                }
            })
        }

        fn request_reconnect(&self, _reason: &'static str) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn manager(ping: u64, pong: u64) -> Arc<HeartbeatManager> {
        HeartbeatManager::new(
            Duration::from_millis(ping),
            Duration::from_millis(pong),
            Duration::from_secs(1),
            true,
        )
    }

    fn bind(manager: &Arc<HeartbeatManager>, parent: &Arc<TestParent>) {
        let weak: Weak<dyn HeartbeatParent> =
            Arc::downgrade(&(Arc::clone(parent) as Arc<dyn HeartbeatParent>));
        manager.bind(weak);
    }

    #[test]
    fn test_initial_state() {
        let hb = manager(1000, 2000);
        assert_eq!(hb.state(), HeartbeatState::Stopped);
        assert!(!hb.is_healthy());
        assert_eq!(hb.missed_pong_count(), 0);
        assert_eq!(hb.stats().rtt_samples, 0);
    }

    #[test]
    fn test_health_score_zero_when_unhealthy() {
        let hb = manager(1000, 2000);
        assert_eq!(hb.connection_health(), 0.0);
    }

    #[test]
    fn test_on_pong_sets_healthy_and_rtt() {
        let hb = manager(1000, 2000);
        hb.last_ping_at.store(1, Ordering::Relaxed);
        hb.on_pong();

        assert!(hb.is_healthy());
        assert_eq!(hb.missed_pong_count(), 0);
        let stats = hb.stats();
        assert_eq!(stats.rtt_samples, 1);
        assert!(stats.min_rtt.is_some());
        assert!(hb.connection_health() > 0.9);
    }

    #[test]
    fn test_rtt_moving_average() {
        let hb = manager(1000, 2000);
        hb.record_rtt(800);
        assert_eq!(hb.rtt_avg_us.load(Ordering::Relaxed), 800);

        hb.record_rtt(1600);
        // 800 + (1600 - 800) / 8 = 900
        assert_eq!(hb.rtt_avg_us.load(Ordering::Relaxed), 900);
        assert_eq!(hb.rtt_min_us.load(Ordering::Relaxed), 800);
        assert_eq!(hb.rtt_max_us.load(Ordering::Relaxed), 1600);
    }

    #[test]
    fn test_freshness_check_counts_missed_pongs() {
        let hb = manager(1000, 10);
        let parent = TestParent::connected();
        bind(&hb, &parent);
        hb.healthy.store(true, Ordering::Relaxed);
        hb.last_pong_at.store(1, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));

        hb.check_freshness();
        assert!(!hb.is_healthy());
        assert_eq!(hb.missed_pong_count(), 1);
        assert_eq!(hb.stats().unhealthy_periods, 1);
        assert_eq!(parent.reconnects.load(Ordering::Relaxed), 0);

        for _ in 0..4 {
            hb.check_freshness();
        }
        assert!(parent.reconnects.load(Ordering::Relaxed) >= 1);
        // Only one unhealthy period despite repeated checks
        assert_eq!(hb.stats().unhealthy_periods, 1);
    }

    #[tokio::test]
    async fn test_ping_loop_sends_pings() {
        let hb = manager(10, 0);
        let parent = TestParent::connected();
        bind(&hb, &parent);

        let cancel = CancellationToken::new();
        hb.start(&cancel);
        assert_eq!(hb.state(), HeartbeatState::Running);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(parent.pings.load(Ordering::Relaxed) >= 2);

        hb.stop().await;
        assert_eq!(hb.state(), HeartbeatState::Stopped);
    }

    #[tokio::test]
    async fn test_ping_failure_requests_reconnect() {
        let hb = manager(10, 0);
        let parent = TestParent::connected();
        parent.ping_ok.store(false, Ordering::Relaxed);
        bind(&hb, &parent);

        let cancel = CancellationToken::new();
        hb.start(&cancel);
        tokio::time::sleep(Duration::from_millis(60)).await;
        hb.stop().await;

        assert!(parent.reconnects.load(Ordering::Relaxed) >= 1);
        assert!(!hb.is_healthy());
    }

    #[tokio::test]
    async fn test_stop_is_bounded_and_idempotent() {
        let hb = manager(10, 20);
        let parent = TestParent::connected();
        bind(&hb, &parent);

        let cancel = CancellationToken::new();
        hb.start(&cancel);

        let started = Instant::now();
        hb.stop().await;
        hb.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(hb.state(), HeartbeatState::Stopped);
        // Queries after stop are safe
        let _ = hb.stats();
        let _ = hb.is_healthy();
    }

    #[tokio::test]
    async fn test_start_twice_is_ignored() {
        let hb = manager(50, 0);
        let parent = TestParent::connected();
        bind(&hb, &parent);

        let cancel = CancellationToken::new();
        hb.start(&cancel);
        hb.start(&cancel);
        assert_eq!(hb.state(), HeartbeatState::Running);
        assert_eq!(hb.tasks.lock().len(), 1);

        hb.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_periods_spawn_nothing() {
        let hb = manager(0, 0);
        let cancel = CancellationToken::new();
        hb.start(&cancel);
        assert_eq!(hb.state(), HeartbeatState::Running);
        assert!(hb.tasks.lock().is_empty());
        hb.stop().await;
    }
}
