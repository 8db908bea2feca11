//! Event-level transport façade
//!
//! Adapts the connection pool into a publish/subscribe API: outgoing events
//! are encoded into opaque frames and balanced over the pool; inbound frames
//! are decoded and dispatched to every handler registered for their event
//! type, in registration order.

pub mod codec;
pub mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use crate::ws::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::{Result, WsError};

pub use codec::{Event, EventCodec, JsonEventCodec};
pub use subscription::{EventHandler, Subscription};
use subscription::EventHandlerWrapper;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pool carrying the event stream
    pub pool: PoolConfig,
    /// Encoded event size ceiling
    pub max_event_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            max_event_size: 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.max_event_size == 0 {
            return Err(WsError::Config("max event size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub events_sent: u64,
    pub events_received: u64,
    pub bytes_transferred: u64,
    pub handler_errors: u64,
    pub decode_errors: u64,
    pub active_subscriptions: usize,
    pub registered_handlers: usize,
}

struct TransportInner {
    config: TransportConfig,
    pool: ConnectionPool,
    codec: Arc<dyn EventCodec>,
    handlers: RwLock<HashMap<String, Vec<EventHandlerWrapper>>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    next_handler_id: AtomicU64,
    events_sent: AtomicU64,
    events_received: AtomicU64,
    bytes_transferred: AtomicU64,
    handler_errors: AtomicU64,
    decode_errors: AtomicU64,
    scope: Mutex<Option<CancellationToken>>,
}

/// Event publish/subscribe surface over a connection pool
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("pool", &self.inner.pool)
            .field("handlers", &self.inner.handlers.read().len())
            .finish()
    }
}

impl Transport {
    /// Transport with the default JSON codec
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_codec(config, Arc::new(JsonEventCodec))
    }

    pub fn with_codec(config: TransportConfig, codec: Arc<dyn EventCodec>) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(config.pool.clone())?;
        Ok(Self {
            inner: Arc::new(TransportInner {
                config,
                pool,
                codec,
                handlers: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(0),
                events_sent: AtomicU64::new(0),
                events_received: AtomicU64::new(0),
                bytes_transferred: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
                scope: Mutex::new(None),
            }),
        })
    }

    /// Start the pool and install the inbound decode/dispatch sink
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

        // Weak: the pool must not keep the transport alive
        let weak: Weak<TransportInner> = Arc::downgrade(&self.inner);
        self.inner.pool.set_message_handler(Arc::new(move |conn_id, msg| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch_frame(&conn_id, msg).await;
                }
            })
        }));

        self.inner.pool.start(&scope).await
    }

    /// Close all subscriptions and stop the pool; idempotent
    pub async fn stop(&self) -> Result<()> {
        let Some(scope) = self.inner.scope.lock().take() else {
            return Ok(());
        };
        scope.cancel();

        let drained: Vec<Subscription> = self
            .inner
            .subscriptions
            .write()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in drained {
            sub.cancel.cancel();
            self.inner.remove_subscription_handlers(&sub);
        }

        self.inner.pool.stop().await
    }

    /// Encode and forward one event through the pool
    ///
    /// Success means enqueued on a member's outbound channel, not delivered.
    pub async fn send_event(&self, cancel: &CancellationToken, event: &Event) -> Result<()> {
        if event.event_type.is_empty() {
            return Err(WsError::EmptyEventType);
        }

        let frame = self.inner.codec.encode(event)?;
        let len = frame.len();
        if len > self.inner.config.max_event_size {
            return Err(WsError::EventTooLarge {
                size: len,
                limit: self.inner.config.max_event_size,
            });
        }

        let msg = if self.inner.codec.text_frames() {
            let text = String::from_utf8(frame).map_err(|e| WsError::Encode(e.to_string()))?;
            Message::text(text)
        } else {
            Message::binary(frame)
        };

        self.inner.pool.send_message(cancel, msg).await?;
        self.inner.events_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_transferred
            .fetch_add(len as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Register a handler; ids are globally unique and increasing
    pub fn add_event_handler(
        &self,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> Result<u64> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(WsError::EmptyEventType);
        }
        let id = self.inner.next_id();
        self.inner
            .handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(EventHandlerWrapper { id, handler });
        Ok(id)
    }

    /// Remove one handler; succeeds exactly once per id
    pub fn remove_event_handler(&self, event_type: &str, handler_id: u64) -> Result<()> {
        if event_type.is_empty() {
            return Err(WsError::EmptyEventType);
        }
        let mut handlers = self.inner.handlers.write();
        let Some(list) = handlers.get_mut(event_type) else {
            return Err(WsError::HandlerNotFound {
                event_type: event_type.to_string(),
                handler_id,
            });
        };
        match list.iter().position(|wrapper| wrapper.id == handler_id) {
            Some(index) => {
                list.remove(index);
                if list.is_empty() {
                    handlers.remove(event_type);
                }
                Ok(())
            }
            None => Err(WsError::HandlerNotFound {
                event_type: event_type.to_string(),
                handler_id,
            }),
        }
    }

    /// Bind one handler to several event types
    ///
    /// Registration is atomic from the caller's perspective: the first
    /// dispatched event observes either none or all of the registrations.
    pub fn subscribe(
        &self,
        cancel: &CancellationToken,
        event_types: Vec<String>,
        handler: EventHandler,
    ) -> Result<Subscription> {
        if event_types.is_empty() {
            return Err(WsError::Config(
                "subscription needs at least one event type".to_string(),
            ));
        }
        if event_types.iter().any(String::is_empty) {
            return Err(WsError::EmptyEventType);
        }

        let sub_cancel = cancel.child_token();
        let wrapped: EventHandler = {
            let user = handler;
            let token = sub_cancel.clone();
            Arc::new(move |event, _dispatch_token| {
                if token.is_cancelled() {
                    // Unsubscribed between snapshot and invocation
                    Box::pin(async { Ok(()) })
                } else {
                    user(event, token.child_token())
                }
            })
        };

        let mut handler_ids = Vec::with_capacity(event_types.len());
        {
            let mut handlers = self.inner.handlers.write();
            for event_type in &event_types {
                let id = self.inner.next_id();
                handlers
                    .entry(event_type.clone())
                    .or_default()
                    .push(EventHandlerWrapper {
                        id,
                        handler: wrapped.clone(),
                    });
                handler_ids.push(id);
            }
        }

        let sub = Subscription::new(event_types, handler_ids, sub_cancel);
        self.inner
            .subscriptions
            .write()
            .insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    /// Cancel a subscription and drop all its handler registrations
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let removed = self.inner.subscriptions.write().remove(subscription_id);
        let Some(sub) = removed else {
            return Err(WsError::SubscriptionNotFound(subscription_id.to_string()));
        };
        sub.cancel.cancel();
        self.inner.remove_subscription_handlers(&sub);
        Ok(())
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.read().values().cloned().collect()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            events_sent: self.inner.events_sent.load(Ordering::Relaxed),
            events_received: self.inner.events_received.load(Ordering::Relaxed),
            bytes_transferred: self.inner.bytes_transferred.load(Ordering::Relaxed),
            handler_errors: self.inner.handler_errors.load(Ordering::Relaxed),
            decode_errors: self.inner.decode_errors.load(Ordering::Relaxed),
            active_subscriptions: self.inner.subscriptions.read().len(),
            registered_handlers: self.inner.handlers.read().values().map(Vec::len).sum(),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn detailed_status(&self) -> serde_json::Value {
        let stats = self.stats();
        serde_json::json!({
            "events_sent": stats.events_sent,
            "events_received": stats.events_received,
            "bytes_transferred": stats.bytes_transferred,
            "handler_errors": stats.handler_errors,
            "decode_errors": stats.decode_errors,
            "subscriptions": self
                .list_subscriptions()
                .iter()
                .map(|sub| sub.id.clone())
                .collect::<Vec<_>>(),
            "pool": self.inner.pool.detailed_status(),
        })
    }

    /// At least one healthy pool member
    pub fn is_connected(&self) -> bool {
        self.inner.pool.get_healthy_connection_count() > 0
    }

    pub fn get_active_connection_count(&self) -> usize {
        self.inner.pool.get_active_connection_count()
    }

    pub fn get_healthy_connection_count(&self) -> usize {
        self.inner.pool.get_healthy_connection_count()
    }
}

impl TransportInner {
    fn next_id(&self) -> u64 {
        self.next_handler_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn remove_subscription_handlers(&self, sub: &Subscription) {
        let mut handlers = self.handlers.write();
        for (event_type, handler_id) in sub.event_types.iter().zip(&sub.handler_ids) {
            if let Some(list) = handlers.get_mut(event_type) {
                list.retain(|wrapper| wrapper.id != *handler_id);
                if list.is_empty() {
                    handlers.remove(event_type);
                }
            }
        }
    }

    /// Decode one inbound frame and invoke handlers in registration order
    async fn dispatch_frame(&self, conn_id: &str, msg: Message) {
        let event = {
            let bytes = match &msg {
                Message::Text(text) => text.as_bytes(),
                Message::Binary(data) => data.as_ref(),
                _ => return,
            };
            match self.codec.decode(bytes) {
                Ok(event) => event,
                Err(e) => {
                    self.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(connection = %conn_id, error = %e, "undecodable frame");
                    return;
                }
            }
        };
        self.events_received.fetch_add(1, Ordering::Relaxed);

        // Snapshot under the read lock, invoke outside it
        let snapshot: Vec<EventHandlerWrapper> = self
            .handlers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        if snapshot.is_empty() {
            return;
        }

        let dispatch_token = self
            .scope
            .lock()
            .as_ref()
            .cloned()
            .unwrap_or_default();

        for wrapper in snapshot {
            let fut = (wrapper.handler)(event.clone(), dispatch_token.child_token());
            match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        handler = wrapper.id,
                        event_type = %event.event_type,
                        error = %e,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        handler = wrapper.id,
                        event_type = %event.event_type,
                        "event handler panicked"
                    );
                }
            }
        }
    }
}
