//! WebSocket connection pool management
//!
//! Maintains a working set of managed connections across the configured URL
//! list with health monitoring, minimum-availability convergence, and load
//! balancing over the healthy members.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ws::connection::{Connection, ConnectionConfig, ConnectionState, MessageHook};
use crate::{Result, WsError};

/// Member selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Atomic cursor over the healthy set
    #[default]
    RoundRobin,
    /// Lowest composite load score
    LeastConnections,
    /// Highest heartbeat health score
    HealthBased,
    /// Uniform pick
    Random,
}

/// Hook fired on health edges of a member
pub type HealthChangeHook = Arc<dyn Fn(&str, bool) + Send + Sync>;
/// Hook fired on state transitions of a member
pub type ConnectionStateHook = Arc<dyn Fn(&str, ConnectionState, ConnectionState) + Send + Sync>;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upstream URLs; members are created round-robin across them
    pub urls: Vec<String>,
    /// Availability floor the health checker converges toward
    pub min_connections: usize,
    /// Hard ceiling on pool size
    pub max_connections: usize,
    /// Member establishment deadline
    pub connection_timeout: Duration,
    /// Health checker period
    pub health_check_interval: Duration,
    /// Continuous-unhealthy window before a member is removed
    pub idle_timeout: Duration,
    /// Member selection strategy
    pub strategy: LoadBalancingStrategy,
    /// Template cloned per member; URL is filled per member
    pub connection_template: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            min_connections: 1,
            max_connections: 4,
            connection_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            strategy: LoadBalancingStrategy::default(),
            connection_template: ConnectionConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(WsError::Config("pool needs at least one URL".to_string()));
        }
        for url in &self.urls {
            let parsed = Url::parse(url).map_err(|e| WsError::Config(e.to_string()))?;
            match parsed.scheme() {
                "ws" | "wss" => {}
                other => {
                    return Err(WsError::Config(format!(
                        "unsupported URL scheme {:?}: {}",
                        other, url
                    )))
                }
            }
        }
        if self.max_connections == 0 {
            return Err(WsError::Config("max connections must be positive".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(WsError::Config(format!(
                "min connections {} exceeds max connections {}",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    fn member_close_budget(&self) -> Duration {
        if self.connection_template.test_mode {
            Duration::from_millis(200)
        } else {
            Duration::from_secs(3)
        }
    }
}

/// Pool statistics (cold path)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub healthy_connections: usize,
    pub unhealthy_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub avg_response_time: Duration,
}

struct MemberEntry {
    conn: Connection,
    last_health: AtomicBool,
    unhealthy_since: Mutex<Option<Instant>>,
}

#[derive(Default)]
struct PoolHooks {
    on_state_change: Option<ConnectionStateHook>,
    on_health_change: Option<HealthChangeHook>,
    message_handler: Option<MessageHook>,
}

struct PoolInner {
    config: PoolConfig,
    members: RwLock<HashMap<String, Arc<MemberEntry>>>,
    rr_cursor: AtomicUsize,
    url_cursor: AtomicUsize,
    member_seq: AtomicU64,
    scope: Mutex<Option<CancellationToken>>,
    checker: Mutex<Option<JoinHandle<()>>>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    bytes_sent: AtomicU64,
    /// Compound value; read and written under a short lock
    ema_response_us: Mutex<f64>,
    hooks: RwLock<PoolHooks>,
}

/// Composite load used by the LeastConnections strategy
fn load_score(pending: u64, send_surplus: u64, errors: u64) -> u64 {
    pending * 100 + send_surplus * 10 + errors * 5
}

fn member_load(conn: &Connection) -> u64 {
    let m = conn.metrics();
    load_score(
        m.pending_outbound,
        m.messages_sent.saturating_sub(m.messages_received),
        m.errors,
    )
}

/// Pool of managed connections over one logical destination
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("members", &self.inner.members.read().len())
            .field("strategy", &self.inner.config.strategy)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                members: RwLock::new(HashMap::new()),
                rr_cursor: AtomicUsize::new(0),
                url_cursor: AtomicUsize::new(0),
                member_seq: AtomicU64::new(0),
                scope: Mutex::new(None),
                checker: Mutex::new(None),
                total_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                ema_response_us: Mutex::new(0.0),
                hooks: RwLock::new(PoolHooks::default()),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Launch the health checker and create the initial members
    ///
    /// Succeeds even when some members fail to establish; the health checker
    /// keeps converging toward the floor.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let scope = {
            let mut slot = self.inner.scope.lock();
            if slot.is_some() {
                return Ok(());
            }
            let scope = cancel.child_token();
            *slot = Some(scope.clone());
            scope
        };

        let checker = {
            let inner = Arc::clone(&self.inner);
            let scope = scope.clone();
            tokio::spawn(async move {
                PoolInner::checker_loop(inner, scope).await;
            })
        };
        *self.inner.checker.lock() = Some(checker);

        for _ in 0..self.inner.config.min_connections {
            match self.inner.create_member(&scope).await {
                Ok(id) => tracing::info!(connection = %id, "pool member established"),
                Err(e) => tracing::warn!(error = %e, "initial pool member failed"),
            }
        }
        Ok(())
    }

    /// Cancel the scope and close every member in parallel; idempotent
    pub async fn stop(&self) -> Result<()> {
        let Some(scope) = self.inner.scope.lock().take() else {
            return Ok(());
        };
        scope.cancel();

        let drained: Vec<Arc<MemberEntry>> =
            self.inner.members.write().drain().map(|(_, e)| e).collect();

        let member_budget = self.inner.config.member_close_budget();
        let closes = drained.into_iter().map(|entry| {
            let conn = entry.conn.clone();
            async move {
                if timeout(member_budget, conn.close()).await.is_err() {
                    tracing::warn!(connection = %conn.id(), "member close exceeded budget");
                }
            }
        });
        // Pool-level ceiling on top of the per-member budget
        let _ = timeout(
            member_budget * 2,
            futures_util::future::join_all(closes),
        )
        .await;

        let checker = self.inner.checker.lock().take();
        if let Some(handle) = checker {
            let _ = timeout(member_budget, handle).await;
        }
        Ok(())
    }

    /// Pick a healthy member by the configured strategy; never suspends
    pub fn get_connection(&self) -> Result<Connection> {
        let members = self.inner.members.read();
        if members.is_empty() {
            return Err(WsError::NoConnection);
        }

        let mut healthy: Vec<&Arc<MemberEntry>> = members
            .values()
            .filter(|entry| entry.conn.is_healthy())
            .collect();
        if healthy.is_empty() {
            return Err(WsError::NoHealthyConnection);
        }
        // Stable order so the round-robin cursor means something
        healthy.sort_by(|a, b| a.conn.id().cmp(b.conn.id()));

        let picked = match self.inner.config.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let cursor = self.inner.rr_cursor.fetch_add(1, Ordering::Relaxed);
                &healthy[cursor % healthy.len()]
            }
            LoadBalancingStrategy::LeastConnections => healthy
                .iter()
                .min_by_key(|entry| member_load(&entry.conn))
                .expect("non-empty healthy set"),
            LoadBalancingStrategy::HealthBased => healthy
                .iter()
                .max_by(|a, b| {
                    a.conn
                        .health_score()
                        .partial_cmp(&b.conn.health_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("non-empty healthy set"),
            LoadBalancingStrategy::Random => {
                let mut hasher = DefaultHasher::new();
                SystemTime::now().hash(&mut hasher);
                &healthy[(hasher.finish() as usize) % healthy.len()]
            }
        };
        Ok(picked.conn.clone())
    }

    /// Forward one frame through a selected member
    ///
    /// Never retried here; retries are the caller's responsibility.
    pub async fn send_message(&self, cancel: &CancellationToken, msg: Message) -> Result<()> {
        let conn = self.get_connection()?;
        let len = msg.len() as u64;
        let started = Instant::now();

        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        match conn.send_message(cancel, msg).await {
            Ok(()) => {
                self.inner.bytes_sent.fetch_add(len, Ordering::Relaxed);
                self.inner.record_response_time(started.elapsed());
                Ok(())
            }
            Err(e) => {
                self.inner.failed_requests.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Members currently in state Connected
    pub fn get_active_connection_count(&self) -> usize {
        self.inner
            .members
            .read()
            .values()
            .filter(|entry| entry.conn.is_connected())
            .count()
    }

    /// Members currently healthy
    pub fn get_healthy_connection_count(&self) -> usize {
        self.inner
            .members
            .read()
            .values()
            .filter(|entry| entry.conn.is_healthy())
            .count()
    }

    pub fn stats(&self) -> PoolStats {
        let members = self.inner.members.read();

        let mut active = 0;
        let mut idle = 0;
        let mut healthy = 0;
        let mut unhealthy = 0;
        let mut bytes_received = 0;
        for entry in members.values() {
            let snapshot = entry.conn.metrics();
            bytes_received += snapshot.bytes_received;
            if entry.conn.is_connected() {
                active += 1;
                if snapshot.pending_outbound == 0 {
                    idle += 1;
                }
                if entry.conn.is_healthy() {
                    healthy += 1;
                } else {
                    unhealthy += 1;
                }
            } else {
                unhealthy += 1;
            }
        }

        let avg_response_time =
            Duration::from_micros(*self.inner.ema_response_us.lock() as u64);
        PoolStats {
            total_connections: members.len(),
            active_connections: active,
            idle_connections: idle,
            healthy_connections: healthy,
            unhealthy_connections: unhealthy,
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            failed_requests: self.inner.failed_requests.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received,
            avg_response_time,
        }
    }

    /// Per-member status for operators
    pub fn detailed_status(&self) -> serde_json::Value {
        let members = self.inner.members.read();
        let connections: Vec<serde_json::Value> = members
            .values()
            .map(|entry| {
                let m = entry.conn.metrics();
                serde_json::json!({
                    "id": entry.conn.id(),
                    "url": entry.conn.config().url,
                    "state": format!("{:?}", entry.conn.state()),
                    "healthy": entry.conn.is_healthy(),
                    "health_score": entry.conn.health_score(),
                    "pending_outbound": m.pending_outbound,
                    "messages_sent": m.messages_sent,
                    "messages_received": m.messages_received,
                    "reconnects": m.reconnects,
                    "errors": m.errors,
                    "last_error": entry.conn.last_error(),
                })
            })
            .collect();

        serde_json::json!({
            "strategy": format!("{:?}", self.inner.config.strategy),
            "total_connections": members.len(),
            "min_connections": self.inner.config.min_connections,
            "max_connections": self.inner.config.max_connections,
            "connections": connections,
        })
    }

    /// Install the single inbound sink, broadcast to present and future
    /// members
    pub fn set_message_handler(&self, hook: MessageHook) {
        self.inner.hooks.write().message_handler = Some(hook.clone());
        let members = self.inner.members.read();
        for entry in members.values() {
            entry.conn.set_on_message(hook.clone());
        }
    }

    pub fn set_on_connection_state_change(&self, hook: ConnectionStateHook) {
        self.inner.hooks.write().on_state_change = Some(hook.clone());
        let members = self.inner.members.read();
        for entry in members.values() {
            entry.conn.set_on_state_change(hook.clone());
        }
    }

    pub fn set_on_health_change(&self, hook: HealthChangeHook) {
        self.inner.hooks.write().on_health_change = Some(hook);
    }
}

impl PoolInner {
    fn record_response_time(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as f64;
        let mut ema = self.ema_response_us.lock();
        if *ema == 0.0 {
            *ema = sample;
        } else {
            *ema += (sample - *ema) * 0.1;
        }
    }

    /// Create one member against the next URL in the rotation
    async fn create_member(self: &Arc<Self>, scope: &CancellationToken) -> Result<String> {
        {
            let members = self.members.read();
            if members.len() >= self.config.max_connections {
                return Err(WsError::Config("pool at maximum capacity".to_string()));
            }
        }

        let url_index = self.url_cursor.fetch_add(1, Ordering::Relaxed);
        let url = self.config.urls[url_index % self.config.urls.len()].clone();

        let unix_second = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let seq = self.member_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("conn_{}_{}_{}", unix_second, seq, url);

        let mut member_config = self.config.connection_template.clone();
        member_config.url = url;
        let conn = Connection::new(id.clone(), member_config)?;

        {
            let hooks = self.hooks.read();
            if let Some(hook) = &hooks.on_state_change {
                conn.set_on_state_change(hook.clone());
            }
            if let Some(hook) = &hooks.message_handler {
                conn.set_on_message(hook.clone());
            }
        }

        match timeout(self.config.connection_timeout, conn.connect(scope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let _ = conn.close().await;
                return Err(WsError::Dial(format!(
                    "member establishment timed out for {}",
                    conn.config().url
                )));
            }
        }
        // Survive transient faults without pool intervention
        conn.start_auto_reconnect(scope);

        let entry = Arc::new(MemberEntry {
            conn: conn.clone(),
            last_health: AtomicBool::new(conn.is_healthy()),
            unhealthy_since: Mutex::new(None),
        });

        let at_capacity = {
            let mut members = self.members.write();
            if members.len() >= self.config.max_connections {
                true
            } else {
                members.insert(id.clone(), entry);
                false
            }
        };
        if at_capacity {
            let _ = conn.close().await;
            return Err(WsError::Config("pool at maximum capacity".to_string()));
        }
        Ok(id)
    }

    async fn remove_member(&self, id: &str) {
        let removed = self.members.write().remove(id);
        if let Some(entry) = removed {
            tracing::warn!(connection = %id, "removing persistently unhealthy member");
            let _ = timeout(self.config.member_close_budget(), entry.conn.close()).await;
        }
    }

    async fn checker_loop(inner: Arc<Self>, scope: CancellationToken) {
        let mut ticker = interval(inner.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => inner.health_pass(&scope).await,
            }
        }
        tracing::debug!("pool health checker stopped");
    }

    async fn health_pass(self: &Arc<Self>, scope: &CancellationToken) {
        let snapshot: Vec<(String, Arc<MemberEntry>)> = self
            .members
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        for (id, entry) in &snapshot {
            let healthy = entry.conn.is_healthy();
            let previous = entry.last_health.swap(healthy, Ordering::Relaxed);
            if previous != healthy {
                let hook = self.hooks.read().on_health_change.clone();
                if let Some(hook) = hook {
                    hook(id, healthy);
                }
            }

            if healthy {
                *entry.unhealthy_since.lock() = None;
            } else {
                let expired = {
                    let mut since = entry.unhealthy_since.lock();
                    since.get_or_insert_with(Instant::now).elapsed() > self.config.idle_timeout
                };
                if expired {
                    self.remove_member(id).await;
                }
            }
        }

        // Converge toward the floor without crossing the ceiling
        loop {
            let (healthy, total) = {
                let members = self.members.read();
                let healthy = members
                    .values()
                    .filter(|entry| entry.conn.is_healthy())
                    .count();
                (healthy, members.len())
            };
            if healthy >= self.config.min_connections || total >= self.config.max_connections {
                break;
            }
            if scope.is_cancelled() {
                break;
            }
            match self.create_member(scope).await {
                Ok(id) => tracing::info!(connection = %id, "pool member re-established"),
                Err(e) => {
                    tracing::warn!(error = %e, "pool member creation failed");
                    break;
                }
            }
        }
    }
}
