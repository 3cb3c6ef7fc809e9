use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use uuid::Uuid;

/// A structured, lightweight event. Payloads are small JSON values (never
/// full message bodies) keyed by the namespaced dot-notation strings in
/// `promptkit_contracts::event_types`.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub run_id: Uuid,
    pub conversation_id: Uuid,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        run_id: Uuid,
        conversation_id: Uuid,
        payload: impl serde::Serialize,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            ts: Utc::now(),
            run_id,
            conversation_id,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event);
}

#[async_trait]
impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    async fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Decoupled pub/sub. Listeners never block publication: `publish` dispatches
/// to each matching listener on its own task and returns once all of them
/// have been spawned, not once they've run. Object-safe so every stage and
/// `ExecutionContext` can hold it as `Arc<dyn EventBus>`.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event);
    async fn subscribe(&self, event_type: String, listener: Arc<dyn EventListener>) -> SubscriptionHandle;
    async fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> SubscriptionHandle;
}

/// Returned by `subscribe`/`subscribe_all`. Dropping it without calling
/// `unsubscribe` leaves the listener registered.
pub struct SubscriptionHandle {
    unsubscribe: Box<dyn FnOnce() + Send>,
}

impl SubscriptionHandle {
    fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Box::new(unsubscribe),
        }
    }

    pub fn unsubscribe(self) {
        (self.unsubscribe)()
    }
}

struct Subscription {
    event_type: Option<String>,
    listener: Arc<dyn EventListener>,
}

struct InMemoryEventBusInner {
    next_id: AtomicU64,
    listeners: StdRwLock<HashMap<u64, Subscription>>,
}

/// The default in-process `EventBus`. Production deployments that want
/// cross-process fan-out wrap this with `promptkit-observability`'s listener
/// that forwards to `tracing`, or an OTLP exporter.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<InMemoryEventBusInner>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryEventBusInner {
                next_id: AtomicU64::new(0),
                listeners: StdRwLock::new(HashMap::new()),
            }),
        }
    }

    fn add(&self, event_type: Option<String>, listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .write()
            .unwrap()
            .insert(id, Subscription { event_type, listener });
        let bus = Arc::downgrade(&self.inner);
        SubscriptionHandle::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.listeners.write().unwrap().remove(&id);
            }
        })
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) {
        let matching: Vec<Arc<dyn EventListener>> = self
            .inner
            .listeners
            .read()
            .unwrap()
            .values()
            .filter(|sub| {
                sub.event_type
                    .as_deref()
                    .map(|t| t == event.event_type)
                    .unwrap_or(true)
            })
            .map(|sub| sub.listener.clone())
            .collect();

        for listener in matching {
            let event = event.clone();
            tokio::spawn(async move {
                let result = AssertUnwindSafe(listener.on_event(&event)).catch_unwind().await;
                if let Err(panic) = result {
                    tracing::error!(
                        event_type = %event.event_type,
                        ?panic,
                        "event listener panicked"
                    );
                }
            });
        }
    }

    async fn subscribe(&self, event_type: String, listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        self.add(Some(event_type), listener)
    }

    async fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        self.add(None, listener)
    }
}

/// Discards every event. Useful as a default when a caller doesn't care about
/// observability, and in unit tests for stages that don't exercise events.
pub struct NoOpEventBus;

#[async_trait]
impl EventBus for NoOpEventBus {
    async fn publish(&self, _event: Event) {}

    async fn subscribe(&self, _event_type: String, _listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        SubscriptionHandle::new(|| {})
    }

    async fn subscribe_all(&self, _listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        SubscriptionHandle::new(|| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener(Arc<AtomicUsize>);

    #[async_trait]
    impl EventListener for CountingListener {
        async fn on_event(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn publish_dispatches_to_matching_listeners_only() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _handle = bus
            .subscribe("pipeline.completed".to_string(), Arc::new(CountingListener(count.clone())))
            .await;

        bus.publish(Event::new(
            "pipeline.started",
            Uuid::now_v7(),
            Uuid::now_v7(),
            serde_json::json!({}),
        ))
        .await;
        bus.publish(Event::new(
            "pipeline.completed",
            Uuid::now_v7(),
            Uuid::now_v7(),
            serde_json::json!({}),
        ))
        .await;

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = bus
            .subscribe_all(Arc::new(CountingListener(count.clone())))
            .await;
        handle.unsubscribe();

        bus.publish(Event::new(
            "pipeline.started",
            Uuid::now_v7(),
            Uuid::now_v7(),
            serde_json::json!({}),
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
