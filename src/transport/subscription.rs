//! Subscriptions and event handlers
//!
//! A subscription binds one handler to one or more event types for its
//! lifetime. Handlers are stored in per-type ordered lists and addressed by
//! monotonically increasing ids, so removal never needs function identity.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::transport::codec::Event;

/// Application event handler
///
/// Invoked in registration order; the token is cancelled when the owning
/// subscription or the transport shuts down. Errors are logged and counted
/// without affecting later handlers.
pub type EventHandler = Arc<
    dyn Fn(Event, CancellationToken) -> BoxFuture<'static, std::result::Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// Handler with its registry id
#[derive(Clone)]
pub(crate) struct EventHandlerWrapper {
    pub id: u64,
    pub handler: EventHandler,
}

impl std::fmt::Debug for EventHandlerWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlerWrapper")
            .field("id", &self.id)
            .finish()
    }
}

/// Caller-owned record binding a handler to event types
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Unique subscription id
    pub id: String,
    /// Event types the handler receives
    pub event_types: Vec<String>,
    /// Registry ids owned by this subscription, one per event type
    pub handler_ids: Vec<u64>,
    /// Cancelled on unsubscribe and on transport stop
    pub(crate) cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        event_types: Vec<String>,
        handler_ids: Vec<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_types,
            handler_ids,
            cancel,
        }
    }

    /// Whether the subscription has been cancelled
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_ids_are_unique() {
        let a = Subscription::new(vec!["x".to_string()], vec![1], CancellationToken::new());
        let b = Subscription::new(vec!["x".to_string()], vec![2], CancellationToken::new());
        assert_ne!(a.id, b.id);
        assert!(a.is_active());
    }

    #[test]
    fn test_cancel_deactivates() {
        let sub = Subscription::new(vec!["x".to_string()], vec![1], CancellationToken::new());
        sub.cancel.cancel();
        assert!(!sub.is_active());
    }
}
