//! Managed WebSocket connection
//!
//! Wraps one framing session with an explicit lifecycle: a state machine,
//! one reader and one writer worker, a heartbeat, and a reconnect driver
//! with exponential backoff. All workers observe cancellation and
//! per-operation deadlines so shutdown completes within a bounded budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::infrastructure::metrics::{ConnectionMetrics, MetricsSnapshot};
use crate::infrastructure::rate_limit::{Admission, RateLimiter};
use crate::ws::heartbeat::{HeartbeatManager, HeartbeatParent, HeartbeatStats};
use crate::ws::session::{self, WsSink, WsSource};
use crate::{Result, WsError};

/// Pause between worker retries after a transport fault
const WORKER_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Connection configuration
///
/// Cloned per pool member from a template; immutable once the connection is
/// created.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL (ws:// or wss://)
    pub url: String,
    /// Reconnect attempt ceiling (0 = unlimited)
    pub max_reconnect_attempts: u32,
    /// First backoff delay
    pub initial_reconnect_delay: Duration,
    /// Backoff ceiling
    pub max_reconnect_delay: Duration,
    /// Backoff growth per failed attempt
    pub reconnect_backoff_multiplier: f64,
    /// TCP dial deadline
    pub dial_timeout: Duration,
    /// WebSocket handshake deadline
    pub handshake_timeout: Duration,
    /// Read deadline (zero disables)
    pub read_timeout: Duration,
    /// Per-frame write deadline (zero disables)
    pub write_timeout: Duration,
    /// Ping interval (zero disables the ping loop)
    pub ping_period: Duration,
    /// Pong freshness window (zero disables the health loop)
    pub pong_wait: Duration,
    /// Inbound message size limit
    pub max_message_size: usize,
    /// Socket read buffer size
    pub read_buffer_size: usize,
    /// Socket write buffer size
    pub write_buffer_size: usize,
    /// Outbound queue depth in frames
    pub outbound_queue: usize,
    /// Reserved for deflate middleware; the core does not negotiate it
    pub enable_compression: bool,
    /// Extra handshake headers
    pub headers: HashMap<String, String>,
    /// Optional outbound admission control
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    /// Shrinks shutdown budgets; never changes observable semantics
    pub test_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_reconnect_attempts: 0,
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            reconnect_backoff_multiplier: 2.0,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(10),
            ping_period: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            max_message_size: 16 * 1024 * 1024,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
            outbound_queue: 256,
            enable_compression: false,
            headers: HashMap::new(),
            rate_limiter: None,
            test_mode: false,
        }
    }
}

impl ConnectionConfig {
    /// Check the fields a connection cannot operate without
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|e| WsError::Config(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(WsError::Config(format!(
                    "unsupported URL scheme {:?}",
                    other
                )))
            }
        }
        if self.reconnect_backoff_multiplier < 1.0 {
            return Err(WsError::Config(
                "reconnect backoff multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(WsError::Config("outbound queue must hold at least one frame".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(WsError::Config("max message size must be positive".to_string()));
        }
        Ok(())
    }

    fn worker_stop_budget(&self) -> Duration {
        if self.test_mode {
            Duration::from_millis(25)
        } else {
            Duration::from_secs(1)
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Closing,
            5 => Self::Closed,
            _ => Self::Disconnected,
        }
    }

    /// Legal transitions; `Closed` is terminal
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Disconnected, Closed)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Closed)
                | (Connected, Reconnecting)
                | (Connected, Closing)
                | (Connected, Closed)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Reconnecting, Closed)
                | (Closing, Disconnected)
                | (Closing, Closed)
        )
    }
}

/// Backoff delay before reconnect attempt number `attempts` (zero-based)
pub(crate) fn backoff_delay(
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempts: u32,
) -> Duration {
    let factor = multiplier.max(1.0).powi(attempts.min(64) as i32);
    let delay = initial.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

/// Hook invoked after a session is established
pub type ConnectHook = Arc<dyn Fn(&str) + Send + Sync>;
/// Hook invoked after a session is torn down
pub type DisconnectHook = Arc<dyn Fn(&str) + Send + Sync>;
/// Hook invoked when a worker records an error
pub type ErrorHook = Arc<dyn Fn(&str, &WsError) + Send + Sync>;
/// Inbound frame sink; awaited by the reader so dispatch stays in receipt order
pub type MessageHook =
    Arc<dyn Fn(String, Message) -> BoxFuture<'static, ()> + Send + Sync>;
/// Internal state observer used by the pool
pub(crate) type StateChangeHook =
    Arc<dyn Fn(&str, ConnectionState, ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
    on_error: Option<ErrorHook>,
    on_message: Option<MessageHook>,
    on_state_change: Option<StateChangeHook>,
}

/// Live session resources; present only between establish and teardown
struct SessionState {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    outbound_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    heartbeat: Arc<HeartbeatManager>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

pub(crate) struct ConnectionInner {
    id: String,
    config: ConnectionConfig,
    state: AtomicU8,
    session: Mutex<Option<SessionState>>,
    hooks: RwLock<Hooks>,
    metrics: ConnectionMetrics,
    last_error: Mutex<Option<String>>,
    reconnect_tx: mpsc::Sender<&'static str>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<&'static str>>>,
    reconnect_attempts: AtomicU32,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Root of every internal worker's cancellation; cancelled by `close`
    lifetime: CancellationToken,
}

/// Managed WebSocket connection handle (cheaply cloneable)
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a disconnected connection
    pub fn new(id: impl Into<String>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        // Single-slot signal: workers raise it without blocking
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id: id.into(),
                config,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                session: Mutex::new(None),
                hooks: RwLock::new(Hooks::default()),
                metrics: ConnectionMetrics::new(),
                last_error: Mutex::new(None),
                reconnect_tx,
                reconnect_rx: Mutex::new(Some(reconnect_rx)),
                reconnect_attempts: AtomicU32::new(0),
                driver: Mutex::new(None),
                lifetime: CancellationToken::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connected and the heartbeat considers the session fresh
    pub fn is_healthy(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner
            .current_heartbeat()
            .map(|hb| hb.is_healthy())
            .unwrap_or(false)
    }

    /// Heartbeat health score in [0, 1]; 0 when not connected
    pub fn health_score(&self) -> f64 {
        if !self.is_connected() {
            return 0.0;
        }
        self.inner
            .current_heartbeat()
            .map(|hb| hb.connection_health())
            .unwrap_or(0.0)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn heartbeat_stats(&self) -> Option<HeartbeatStats> {
        self.inner.current_heartbeat().map(|hb| hb.stats())
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Frames enqueued but not yet written
    pub fn pending_outbound(&self) -> u64 {
        self.inner.metrics.pending_outbound()
    }

    pub fn set_on_connect(&self, hook: ConnectHook) {
        self.inner.hooks.write().on_connect = Some(hook);
    }

    pub fn set_on_disconnect(&self, hook: DisconnectHook) {
        self.inner.hooks.write().on_disconnect = Some(hook);
    }

    pub fn set_on_error(&self, hook: ErrorHook) {
        self.inner.hooks.write().on_error = Some(hook);
    }

    pub fn set_on_message(&self, hook: MessageHook) {
        self.inner.hooks.write().on_message = Some(hook);
    }

    pub(crate) fn set_on_state_change(&self, hook: StateChangeHook) {
        self.inner.hooks.write().on_state_change = Some(hook);
    }

    /// Establish the session; valid only from `Disconnected`
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if !self
            .inner
            .try_transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(WsError::InvalidState {
                operation: "connect",
                state: self.state(),
            });
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(WsError::Cancelled),
            r = self.inner.establish() => r,
        };

        if let Err(e) = &result {
            self.inner.record_error(e);
            self.inner
                .try_transition(ConnectionState::Connecting, ConnectionState::Disconnected);
        }
        result
    }

    /// Tear the session down without closing the connection for good
    pub async fn disconnect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Connected => {
                self.inner
                    .try_transition(ConnectionState::Connected, ConnectionState::Closing);
                self.inner.teardown_session().await;
                self.inner
                    .try_transition(ConnectionState::Closing, ConnectionState::Disconnected);
                self.inner.metrics.record_disconnected();
                self.inner.invoke_disconnect_hook();
                Ok(())
            }
            from @ (ConnectionState::Connecting | ConnectionState::Reconnecting) => {
                self.inner.try_transition(from, ConnectionState::Disconnected);
                self.inner.teardown_session().await;
                Ok(())
            }
            state => Err(WsError::InvalidState {
                operation: "disconnect",
                state,
            }),
        }
    }

    /// Permanent shutdown; idempotent, completes within a bounded budget
    pub async fn close(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }

        let was_connected = self.state() == ConnectionState::Connected;
        self.inner
            .try_transition(ConnectionState::Connected, ConnectionState::Closing);

        // Cancels the reconnect driver and every session worker
        self.inner.lifetime.cancel();
        self.inner.teardown_session().await;

        let driver = self.inner.driver.lock().take();
        if let Some(handle) = driver {
            let _ = timeout(self.inner.config.worker_stop_budget(), handle).await;
        }

        self.inner.force_state(ConnectionState::Closed);
        if was_connected {
            self.inner.metrics.record_disconnected();
            self.inner.invoke_disconnect_hook();
        }
        Ok(())
    }

    /// Enqueue a frame on the bounded outbound channel
    ///
    /// Returns when enqueued, with `Cancelled` on external or internal
    /// cancellation, or with `Backpressure` when the queue stays full until
    /// the caller's token fires. Metrics are accounted at enqueue time.
    pub async fn send_message(&self, cancel: &CancellationToken, msg: Message) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(WsError::InvalidState {
                operation: "send_message",
                state,
            });
        }

        if let Some(limiter) = &self.inner.config.rate_limiter {
            loop {
                match limiter.admit() {
                    Admission::Granted => break,
                    Admission::Rejected => return Err(WsError::RateLimited),
                    Admission::Delayed(wait) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(WsError::Cancelled),
                            _ = self.inner.lifetime.cancelled() => return Err(WsError::Cancelled),
                            _ = sleep(wait) => {}
                        }
                    }
                }
            }
        }

        let tx = {
            let session = self.inner.session.lock();
            match session.as_ref() {
                Some(s) => s.outbound_tx.clone(),
                None => {
                    return Err(WsError::InvalidState {
                        operation: "send_message",
                        state: self.state(),
                    })
                }
            }
        };

        let len = msg.len();
        match tx.try_send(msg) {
            Ok(()) => {
                self.inner.metrics.record_message_out(len);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(WsError::Closed),
            Err(TrySendError::Full(msg)) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(WsError::Backpressure),
                    _ = self.inner.lifetime.cancelled() => Err(WsError::Cancelled),
                    permit = tx.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(msg);
                            self.inner.metrics.record_message_out(len);
                            Ok(())
                        }
                        Err(_) => Err(WsError::Closed),
                    }
                }
            }
        }
    }

    /// Spawn the reconnect driver consuming the single-slot signal
    ///
    /// A second call is a no-op; the driver lives until `close` or until the
    /// attempt ceiling is exhausted.
    pub fn start_auto_reconnect(&self, cancel: &CancellationToken) {
        let Some(rx) = self.inner.reconnect_rx.lock().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let external = cancel.clone();
        let handle = tokio::spawn(async move {
            inner.reconnect_driver(rx, external).await;
        });
        *self.inner.driver.lock() = Some(handle);
    }
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn try_transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        if !from.can_transition(to) {
            return false;
        }
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.notify_state_change(from, to);
        }
        swapped
    }

    /// Jump to a state every row of the DAG allows (only `Closed` qualifies)
    fn force_state(&self, to: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.swap(to as u8, Ordering::AcqRel));
        if prev != to {
            self.notify_state_change(prev, to);
        }
    }

    fn notify_state_change(&self, from: ConnectionState, to: ConnectionState) {
        tracing::debug!(connection = %self.id, ?from, ?to, "state change");
        let hook = self.hooks.read().on_state_change.clone();
        if let Some(hook) = hook {
            hook(&self.id, from, to);
        }
    }

    fn current_heartbeat(&self) -> Option<Arc<HeartbeatManager>> {
        self.session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.heartbeat))
    }

    fn record_error(&self, error: &WsError) {
        self.metrics.record_error();
        *self.last_error.lock() = Some(error.to_string());
        let hook = self.hooks.read().on_error.clone();
        if let Some(hook) = hook {
            hook(&self.id, error);
        }
    }

    fn invoke_disconnect_hook(&self) {
        let hook = self.hooks.read().on_disconnect.clone();
        if let Some(hook) = hook {
            hook(&self.id);
        }
    }

    fn request_reconnect_signal(&self, reason: &'static str) {
        // Single-slot channel; a pending signal already covers this fault
        let _ = self.reconnect_tx.try_send(reason);
    }

    /// Dial and install a session; caller must hold state Connecting or
    /// Reconnecting
    async fn establish(self: &Arc<Self>) -> Result<()> {
        self.metrics.record_connect_attempt();
        let stream = session::dial(&self.config).await?;

        if self.lifetime.is_cancelled() {
            return Err(WsError::Closed);
        }

        let from = self.state();
        if !matches!(
            from,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) || !self.try_transition(from, ConnectionState::Connected)
        {
            // close() raced the dial; drop the fresh stream
            return Err(WsError::Closed);
        }

        let (sink, source) = stream.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let cancel = self.lifetime.child_token();

        let heartbeat = HeartbeatManager::new(
            self.config.ping_period,
            self.config.pong_wait,
            self.config.write_timeout,
            self.config.test_mode,
        );
        heartbeat.bind(Arc::downgrade(
            &(Arc::clone(self) as Arc<dyn HeartbeatParent>),
        ));

        let reader = {
            let inner = Arc::clone(self);
            let sink = Arc::clone(&sink);
            let hb = Arc::clone(&heartbeat);
            let token = cancel.clone();
            tokio::spawn(async move {
                inner.read_pump(source, sink, hb, token).await;
            })
        };
        let writer = {
            let inner = Arc::clone(self);
            let sink = Arc::clone(&sink);
            let token = cancel.clone();
            tokio::spawn(async move {
                inner.write_pump(outbound_rx, sink, token).await;
            })
        };

        heartbeat.start(&cancel);

        let previous = self.session.lock().replace(SessionState {
            sink,
            outbound_tx,
            cancel,
            heartbeat,
            reader: Some(reader),
            writer: Some(writer),
        });
        debug_assert!(previous.is_none(), "session installed twice");

        self.metrics.record_connected();
        tracing::info!(connection = %self.id, url = %self.config.url, "connected");

        let hook = self.hooks.read().on_connect.clone();
        if let Some(hook) = hook {
            hook(&self.id);
        }
        Ok(())
    }

    /// Stop heartbeat, cancel workers, close the sink, and wait bounded
    async fn teardown_session(&self) {
        let session = self.session.lock().take();
        let Some(mut session) = session else {
            return;
        };

        session.heartbeat.stop().await;
        session.cancel.cancel();
        drop(session.outbound_tx);

        let budget = self.config.worker_stop_budget();
        {
            let sink = Arc::clone(&session.sink);
            let _ = timeout(budget, async move {
                let mut guard = sink.lock().await;
                let _ = guard.close().await;
            })
            .await;
        }

        for handle in [session.reader.take(), session.writer.take()]
            .into_iter()
            .flatten()
        {
            let _ = timeout(budget, handle).await;
        }
    }

    async fn read_pump(
        self: Arc<Self>,
        mut source: WsSource,
        sink: Arc<tokio::sync::Mutex<WsSink>>,
        heartbeat: Arc<HeartbeatManager>,
        cancel: CancellationToken,
    ) {
        // tungstenite has no socket read deadline; bound each read instead.
        // Pong freshness itself is the heartbeat's job.
        let read_budget = match (self.config.read_timeout, self.config.pong_wait) {
            (r, p) if r.is_zero() && p.is_zero() => None,
            (r, p) => Some(r.max(p)),
        };

        loop {
            let item = if let Some(budget) = read_budget {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = timeout(budget, source.next()) => match next {
                        Ok(item) => item,
                        Err(_) => {
                            self.on_worker_error(WsError::Read("read timed out".to_string()));
                            Self::pause(&cancel).await;
                            continue;
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = source.next() => item,
                }
            };

            match item {
                None => {
                    if self.state() == ConnectionState::Connected {
                        self.on_worker_error(WsError::Read("stream ended".to_string()));
                    }
                    break;
                }
                Some(Err(e)) => {
                    self.on_worker_error(WsError::Read(e.to_string()));
                    Self::pause(&cancel).await;
                }
                Some(Ok(msg)) => match msg {
                    Message::Text(_) | Message::Binary(_) => {
                        self.metrics.record_message_in(msg.len());
                        let hook = self.hooks.read().on_message.clone();
                        if let Some(hook) = hook {
                            // Serialized dispatch, abandoned on teardown
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = hook(self.id.clone(), msg) => {}
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        let sink = Arc::clone(&sink);
                        let _ = timeout(Duration::from_secs(1), async move {
                            let mut guard = sink.lock().await;
                            let _ = guard.send(Message::Pong(payload)).await;
                        })
                        .await;
                    }
                    Message::Pong(_) => heartbeat.on_pong(),
                    Message::Close(frame) => {
                        let detail = frame
                            .map(|f| format!("close frame: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "close frame".to_string());
                        *self.last_error.lock() = Some(detail);
                        if self.state() == ConnectionState::Connected {
                            self.request_reconnect_signal("close frame received");
                        }
                        break;
                    }
                    Message::Frame(_) => {}
                },
            }
        }
    }

    async fn write_pump(
        self: Arc<Self>,
        mut outbound_rx: mpsc::Receiver<Message>,
        sink: Arc<tokio::sync::Mutex<WsSink>>,
        cancel: CancellationToken,
    ) {
        let write_budget = if self.config.write_timeout.is_zero() {
            Duration::from_secs(3600)
        } else {
            self.config.write_timeout
        };

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = outbound_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                }
            };
            self.metrics.record_message_written();

            let frame_sink = Arc::clone(&sink);
            let result = tokio::select! {
                // Abandon an in-flight write at teardown so close stays bounded
                _ = cancel.cancelled() => break,
                result = timeout(write_budget, async move {
                    let mut guard = frame_sink.lock().await;
                    guard.send(msg).await
                }) => result,
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.on_worker_error(WsError::Write(e.to_string()));
                    Self::pause(&cancel).await;
                }
                Err(_) => {
                    self.on_worker_error(WsError::Write("write timed out".to_string()));
                    Self::pause(&cancel).await;
                }
            }
        }
    }

    fn on_worker_error(&self, error: WsError) {
        self.record_error(&error);
        if self.state() == ConnectionState::Connected {
            self.request_reconnect_signal("transport fault");
        }
    }

    async fn pause(cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(WORKER_ERROR_BACKOFF) => {}
        }
    }

    async fn reconnect_driver(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<&'static str>,
        external: CancellationToken,
    ) {
        loop {
            let reason = tokio::select! {
                _ = external.cancelled() => break,
                _ = self.lifetime.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(reason) => reason,
                    None => break,
                }
            };

            if matches!(
                self.state(),
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                break;
            }
            tracing::info!(connection = %self.id, reason, "reconnecting");

            self.try_transition(ConnectionState::Connected, ConnectionState::Reconnecting);
            self.teardown_session().await;
            self.metrics.record_disconnected();
            self.invoke_disconnect_hook();
            // Drop a duplicate signal raised by the other worker
            while signals.try_recv().is_ok() {}

            if self.state() != ConnectionState::Reconnecting {
                continue;
            }

            loop {
                let attempts = self.reconnect_attempts.load(Ordering::Relaxed);
                if self.config.max_reconnect_attempts > 0
                    && attempts >= self.config.max_reconnect_attempts
                {
                    tracing::warn!(connection = %self.id, attempts, "reconnect attempts exhausted");
                    let error = WsError::Dial("reconnect attempts exhausted".to_string());
                    self.record_error(&error);
                    self.try_transition(
                        ConnectionState::Reconnecting,
                        ConnectionState::Disconnected,
                    );
                    return;
                }

                let delay = backoff_delay(
                    self.config.initial_reconnect_delay,
                    self.config.max_reconnect_delay,
                    self.config.reconnect_backoff_multiplier,
                    attempts,
                );
                tokio::select! {
                    _ = external.cancelled() => return,
                    _ = self.lifetime.cancelled() => return,
                    _ = sleep(delay) => {}
                }
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);

                match self.establish().await {
                    Ok(()) => {
                        self.reconnect_attempts.store(0, Ordering::Relaxed);
                        self.metrics.record_reconnected();
                        break;
                    }
                    Err(WsError::Closed) => return,
                    Err(e) => {
                        tracing::warn!(connection = %self.id, error = %e, "reconnect attempt failed");
                        self.record_error(&e);
                    }
                }
            }
        }
    }
}

impl HeartbeatParent for ConnectionInner {
    fn parent_id(&self) -> String {
        self.id.clone()
    }

    fn parent_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn write_ping(&self, budget: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let sink = self
                .session
                .lock()
                .as_ref()
                .map(|s| Arc::clone(&s.sink));
            let Some(sink) = sink else {
                return Err(WsError::InvalidState {
                    operation: "ping",
                    state: self.state(),
                });
            };

            // Same lock as the writer worker: never two concurrent writers
            match timeout(budget, async move {
                let mut guard = sink.lock().await;
                guard.send(Message::Ping(Bytes::new())).await
            })
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(WsError::Write(e.to_string())),
                Err(_) => Err(WsError::Write("ping write timed out".to_string())),
            }
        })
    }

    fn request_reconnect(&self, reason: &'static str) {
        self.request_reconnect_signal(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(url: &str) -> ConnectionConfig {
        ConnectionConfig {
            url: url.to_string(),
            dial_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            ping_period: Duration::from_millis(50),
            pong_wait: Duration::from_millis(200),
            initial_reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(100),
            test_mode: true,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(test_config("ws://localhost:9001/ws").validate().is_ok());
        assert!(test_config("wss://localhost/ws").validate().is_ok());

        let err = test_config("http://localhost/ws").validate().unwrap_err();
        assert!(matches!(err, WsError::Config(_)));

        let mut bad = test_config("ws://localhost/ws");
        bad.reconnect_backoff_multiplier = 0.5;
        assert!(bad.validate().is_err());

        let mut bad = test_config("ws://localhost/ws");
        bad.outbound_queue = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition(Connecting));
        assert!(Disconnected.can_transition(Closed));
        assert!(!Disconnected.can_transition(Connected));
        assert!(Connecting.can_transition(Connected));
        assert!(Connecting.can_transition(Disconnected));
        assert!(Connected.can_transition(Reconnecting));
        assert!(Connected.can_transition(Closing));
        assert!(Reconnecting.can_transition(Connected));
        assert!(Closing.can_transition(Disconnected));
        // Closed is terminal
        for to in [Disconnected, Connecting, Connected, Reconnecting, Closing, Closed] {
            assert!(!Closed.can_transition(to));
        }
    }

    #[test]
    fn test_backoff_law() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(1);

        assert_eq!(backoff_delay(initial, max, 2.0, 0), initial);
        assert_eq!(backoff_delay(initial, max, 2.0, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(initial, max, 2.0, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(initial, max, 2.0, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(initial, max, 2.0, 4), max);
        assert_eq!(backoff_delay(initial, max, 2.0, 10), max);
    }

    proptest! {
        #[test]
        fn prop_backoff_monotone_and_capped(attempts in 0u32..40, next in 1u32..10) {
            let initial = Duration::from_millis(100);
            let max = Duration::from_secs(5);
            let a = backoff_delay(initial, max, 1.7, attempts);
            let b = backoff_delay(initial, max, 1.7, attempts + next);
            prop_assert!(b >= a);
            prop_assert!(a <= max);
            prop_assert!(backoff_delay(initial, max, 1.7, 0) == initial);
        }

        #[test]
        fn prop_random_walk_stays_in_dag(steps in proptest::collection::vec(0u8..6, 0..64)) {
            use ConnectionState::*;
            let mut state = Disconnected;
            for step in steps {
                let to = ConnectionState::from_u8(step);
                if state.can_transition(to) {
                    state = to;
                }
                // Terminal state accepts nothing
                if state == Closed {
                    for candidate in [Disconnected, Connecting, Connected, Reconnecting, Closing, Closed] {
                        prop_assert!(!state.can_transition(candidate));
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_connect_send_receive_close() {
        let (addr, _server) = test_utils::spawn_echo_server().await;
        let conn = Connection::new("c1", test_config(&test_utils::ws_url(addr))).unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&received);
        conn.set_on_message(Arc::new(move |_id, _msg| {
            let observed = Arc::clone(&observed);
            Box::pin(async move {
                observed.fetch_add(1, Ordering::Relaxed);
            })
        }));

        let cancel = CancellationToken::new();
        conn.connect(&cancel).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        for i in 0..5 {
            conn.send_message(&cancel, Message::text(format!("msg-{i}")))
                .await
                .unwrap();
        }

        test_utils::wait_until(Duration::from_secs(3), || {
            received.load(Ordering::Relaxed) >= 5
        })
        .await;
        assert!(received.load(Ordering::Relaxed) >= 5);

        let snapshot = conn.metrics();
        assert_eq!(snapshot.messages_sent, 5);
        assert!(snapshot.messages_received >= 5);

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        // Idempotent
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_twice_is_state_error() {
        let (addr, _server) = test_utils::spawn_echo_server().await;
        let conn = Connection::new("c2", test_config(&test_utils::ws_url(addr))).unwrap();
        let cancel = CancellationToken::new();

        conn.connect(&cancel).await.unwrap();
        let err = conn.connect(&cancel).await.unwrap_err();
        assert!(matches!(err, WsError::InvalidState { .. }));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_when_disconnected_is_state_error() {
        let conn = Connection::new("c3", test_config("ws://127.0.0.1:9/")).unwrap();
        let cancel = CancellationToken::new();

        let err = conn
            .send_message(&cancel, Message::text("nope"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WsError::InvalidState {
                operation: "send_message",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_dial_error() {
        let conn = Connection::new("c4", test_config("ws://127.0.0.1:9/")).unwrap();
        let cancel = CancellationToken::new();

        let err = conn.connect(&cancel).await.unwrap_err();
        assert!(matches!(err, WsError::Dial(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.last_error().is_some());
    }

    #[tokio::test]
    async fn test_backpressure_on_full_queue() {
        let (addr, _server) = test_utils::spawn_blackhole_server().await;
        let mut config = test_config(&test_utils::ws_url(addr));
        config.outbound_queue = 1;
        config.write_timeout = Duration::from_secs(30);
        config.ping_period = Duration::ZERO;
        config.pong_wait = Duration::ZERO;
        let conn = Connection::new("c5", config).unwrap();
        let cancel = CancellationToken::new();
        conn.connect(&cancel).await.unwrap();

        // A blackhole server never reads; large frames fill the TCP window
        // and the writer blocks, so the queue eventually stays full.
        let payload = "x".repeat(512 * 1024);
        let mut saw_backpressure = false;
        for _ in 0..64 {
            let send_cancel = CancellationToken::new();
            let canceller = send_cancel.clone();
            let guard = tokio::spawn(async move {
                sleep(Duration::from_millis(100)).await;
                canceller.cancel();
            });
            match conn.send_message(&send_cancel, Message::text(payload.clone())).await {
                Ok(()) => {}
                Err(WsError::Backpressure) => {
                    saw_backpressure = true;
                    let _ = guard.await;
                    break;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
            let _ = guard.await;
        }
        assert!(saw_backpressure);

        let started = std::time::Instant::now();
        conn.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_server_drop() {
        let (addr, _server) = test_utils::spawn_drop_server(Duration::from_millis(50)).await;
        let conn = Connection::new("c6", test_config(&test_utils::ws_url(addr))).unwrap();
        let cancel = CancellationToken::new();

        conn.connect(&cancel).await.unwrap();
        conn.start_auto_reconnect(&cancel);

        // The server drops the TCP stream shortly after accept; the reader
        // raises the reconnect signal and the driver re-dials the same
        // server, which accepts again.
        test_utils::wait_until(Duration::from_secs(5), || {
            conn.metrics().reconnects >= 1
        })
        .await;
        assert!(conn.metrics().reconnects >= 1);
        assert!(conn.metrics().disconnects >= 1);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_attempts_exhausted_goes_disconnected() {
        let (addr, server) = test_utils::spawn_drop_server(Duration::from_millis(20)).await;
        let mut config = test_config(&test_utils::ws_url(addr));
        config.max_reconnect_attempts = 2;
        config.initial_reconnect_delay = Duration::from_millis(10);
        let conn = Connection::new("c7", config).unwrap();
        let cancel = CancellationToken::new();

        conn.connect(&cancel).await.unwrap();
        conn.start_auto_reconnect(&cancel);

        // Kill the server so every reconnect attempt fails
        server.abort();
        test_utils::wait_until(Duration::from_secs(5), || {
            conn.state() == ConnectionState::Disconnected
        })
        .await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_while_queue_loaded_is_bounded() {
        let (addr, _server) = test_utils::spawn_blackhole_server().await;
        let mut config = test_config(&test_utils::ws_url(addr));
        config.outbound_queue = 1024;
        config.ping_period = Duration::ZERO;
        config.pong_wait = Duration::ZERO;
        config.write_timeout = Duration::from_secs(30);
        let conn = Connection::new("c8", config).unwrap();
        let cancel = CancellationToken::new();
        conn.connect(&cancel).await.unwrap();

        // Fill whatever fits without waiting: the pre-cancelled token turns
        // a full queue into an immediate Backpressure return.
        let payload = "y".repeat(64 * 1024);
        let full = CancellationToken::new();
        full.cancel();
        for _ in 0..1000 {
            let _ = conn.send_message(&full, Message::text(payload.clone())).await;
        }
        assert!(conn.pending_outbound() > 0);

        let started = std::time::Instant::now();
        conn.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
