//! Event bus
//!
//! Typed publish/subscribe. Synchronous handlers run inline on the
//! publisher's task; asynchronous handlers are spawned concurrently and all
//! of them are awaited before `publish` returns, so a single publisher
//! observes its own events in order.
//!
//! Handlers own their error handling: the bus offers no propagation channel,
//! so a handler that can fail must log and swallow. A panicking async
//! handler is caught by its task and logged; it never takes down the
//! publisher or the other handlers.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::events::{Event, EventKind};

type SyncHandler = Arc<dyn Fn(&Event) + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    sync_handlers: RwLock<HashMap<EventKind, Vec<SyncHandler>>>,
    async_handlers: RwLock<HashMap<EventKind, Vec<AsyncHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler, executed inline on publish.
    pub fn subscribe_sync<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.sync_handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register an asynchronous handler, scheduled concurrently on publish.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.async_handlers
            .write()
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Publish an event and wait for all of its handlers.
    ///
    /// Handler lists are snapshotted up front: subscribing from inside a
    /// handler is safe and takes effect on the next publish.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        tracing::trace!(session_id = %event.session_id, ?kind, "publish event");

        let sync: Vec<SyncHandler> = self
            .sync_handlers
            .read()
            .get(&kind)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for handler in &sync {
            handler(&event);
        }

        let async_: Vec<AsyncHandler> = self
            .async_handlers
            .read()
            .get(&kind)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        if async_.is_empty() {
            return;
        }

        let tasks: Vec<_> = async_
            .iter()
            .map(|handler| tokio::spawn(handler(event.clone())))
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(?kind, error = %err, "event handler panicked");
            }
        }
    }

    /// Drop every registration. Used on process shutdown.
    pub fn clear(&self) {
        self.sync_handlers.write().clear();
        self.async_handlers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text_event(content: &str) -> Event {
        Event::new(
            "s1",
            EventPayload::TextMessageReceived {
                content: content.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn async_handlers_complete_before_publish_returns() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe(EventKind::TextMessageReceived, move |_ev| {
            let seen = seen2.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish(text_event("a")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_panicking_handler_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::TextMessageReceived, |_ev| async {
            panic!("boom");
        });
        let seen2 = seen.clone();
        bus.subscribe(EventKind::TextMessageReceived, move |_ev| {
            let seen = seen2.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish(text_event("a")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_publisher_order_is_preserved() {
        let bus = EventBus::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log2 = log.clone();
        bus.subscribe(EventKind::TextMessageReceived, move |ev| {
            let log = log2.clone();
            async move {
                if let EventPayload::TextMessageReceived { content } = ev.payload {
                    log.lock().push(content);
                }
            }
        });

        for i in 0..10 {
            bus.publish(text_event(&i.to_string())).await;
        }
        let got = log.lock().clone();
        let want: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn subscribe_during_publish_applies_next_event() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let bus2 = bus.clone();
        let seen2 = seen.clone();
        bus.subscribe(EventKind::TextMessageReceived, move |_ev| {
            let bus = bus2.clone();
            let seen = seen2.clone();
            async move {
                let seen_inner = seen.clone();
                bus.subscribe_sync(EventKind::TextMessageReceived, move |_| {
                    seen_inner.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        bus.publish(text_event("first")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        bus.publish(text_event("second")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sync_handlers_run_inline() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.subscribe_sync(EventKind::TextMessageReceived, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(text_event("a")).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
