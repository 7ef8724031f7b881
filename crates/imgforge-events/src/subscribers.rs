use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};

use crate::event::Event;

/// Registry of per-build status subscribers, guarded by a reader/writer
/// lock (spec §4.G). Broadcasts are non-blocking try-sends — a slow or
/// stalled subscriber never blocks the status writer; the consumer is
/// expected to catch up from the store (the broadcast is lossy by
/// design).
pub struct SubscriberRegistry {
    inner: RwLock<HashMap<String, Vec<(u64, mpsc::Sender<Event>)>>>,
    next_ticket: AtomicU64,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Register a new status subscriber for `id`. The returned ticket
    /// must be passed to [`Self::unregister`] when the subscriber is
    /// done, or it leaks a dead sender in the map until the next
    /// broadcast happens to notice the receiver is gone (try_send simply
    /// fails silently either way, so this is a slow leak, not a
    /// correctness bug — but callers should still always unregister).
    pub async fn register(&self, id: &str, capacity: usize) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.write().await;
        map.entry(id.to_string()).or_default().push((ticket, tx));
        (ticket, rx)
    }

    pub async fn unregister(&self, id: &str, ticket: u64) {
        let mut map = self.inner.write().await;
        if let Some(subs) = map.get_mut(id) {
            subs.retain(|(t, _)| *t != ticket);
            if subs.is_empty() {
                map.remove(id);
            }
        }
    }

    /// Broadcast `event` to every live subscriber of `id`. Drops the
    /// event for any subscriber whose channel is full or closed.
    pub async fn broadcast(&self, id: &str, event: Event) {
        let map = self.inner.read().await;
        if let Some(subs) = map.get(id) {
            for (_, tx) in subs {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    pub async fn subscriber_count(&self, id: &str) -> usize {
        let map = self.inner.read().await;
        map.get(id).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgforge_core::BuildStatus;

    #[tokio::test]
    async fn test_register_then_broadcast_delivers() {
        let registry = SubscriberRegistry::new();
        let (_ticket, mut rx) = registry.register("b-1", 10).await;
        registry
            .broadcast(
                "b-1",
                Event::Status {
                    new_state: BuildStatus::Building,
                    ts: "t".to_string(),
                },
            )
            .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Status { new_state: BuildStatus::Building, .. }));
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let registry = SubscriberRegistry::new();
        let (ticket, mut rx) = registry.register("b-1", 10).await;
        registry.unregister("b-1", ticket).await;
        registry
            .broadcast(
                "b-1",
                Event::Heartbeat { ts: "t".to_string() },
            )
            .await;
        assert_eq!(registry.subscriber_count("b-1").await, 0);
        // the channel is dropped (sender removed), so recv resolves to None
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_id_is_noop() {
        let registry = SubscriberRegistry::new();
        registry
            .broadcast("nonexistent", Event::Heartbeat { ts: "t".to_string() })
            .await;
    }

    #[tokio::test]
    async fn test_full_channel_drops_event_without_blocking() {
        let registry = SubscriberRegistry::new();
        let (_ticket, _rx) = registry.register("b-1", 1).await;
        // fill the channel, then send one more — must not block or panic
        for _ in 0..3 {
            registry
                .broadcast("b-1", Event::Heartbeat { ts: "t".to_string() })
                .await;
        }
    }
}
