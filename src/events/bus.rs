//! In-process publish/subscribe hub.
//!
//! Handlers register per [`EventKind`] and run, in registration order,
//! inside `publish`. Observers that only want to watch the stream (logs,
//! the CLI `serve` loop) subscribe to a broadcast channel instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::metrics::MetricsCollector;

use super::types::{EventKind, PipelineEvent};

/// Error returned by an event handler.
#[derive(Debug, Error)]
pub enum EventError {
    /// The handler could not process the event.
    #[error("{handler} failed: {message}")]
    Handler { handler: String, message: String },
}

impl EventError {
    pub fn handler(handler: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EventError::Handler {
            handler: handler.into(),
            message: err.to_string(),
        }
    }
}

/// A component that reacts to pipeline events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handles one event. Handlers reload state from the datastore and must
    /// tolerate seeing the same event more than once.
    async fn handle(&self, event: &PipelineEvent) -> Result<(), EventError>;
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that returned `Ok`.
    pub handled: usize,
    /// Handlers that returned an error (already logged).
    pub failed: usize,
    /// Broadcast observers the event reached.
    pub observers: usize,
}

/// Process-wide event hub.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("observers", &self.tx.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Creates a bus whose observer channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            tx,
            capacity,
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers `handler` for one event kind.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(kind = %kind, handler = handler.name(), "Registered event handler");
        handlers.entry(kind).or_default().push(handler);
    }

    /// Registers `handler` for several kinds.
    pub fn register_all(&self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) {
        for kind in kinds {
            self.register(*kind, Arc::clone(&handler));
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers_for(kind).len()
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(&kind).cloned().unwrap_or_default()
    }

    /// Subscribes to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Current number of broadcast observers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Dispatches `event` to its handlers, then to broadcast observers.
    ///
    /// A failing handler is logged and does not stop the others.
    pub async fn publish(&self, event: PipelineEvent) -> PublishReport {
        let kind = event.kind();
        self.metrics.record_event(kind.as_str());

        let mut report = PublishReport::default();
        for handler in self.handlers_for(kind) {
            match handler.handle(&event).await {
                Ok(()) => report.handled += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        kind = %kind,
                        handler = handler.name(),
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }

        // No observers is normal outside `serve`.
        report.observers = self.tx.send(event).unwrap_or(0);

        debug!(
            kind = %kind,
            handled = report.handled,
            failed = report.failed,
            observers = report.observers,
            "Published event"
        );
        report
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _event: &PipelineEvent) -> Result<(), EventError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EventError::handler("counting", "boom"));
            }
            Ok(())
        }
    }

    fn approved() -> PipelineEvent {
        PipelineEvent::ImageApproved {
            project_id: "p1".to_string(),
            character_slug: "mira".to_string(),
            image_id: "i1".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_handlers_run_per_kind() {
        let bus = EventBus::new(16);
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        bus.register(EventKind::ImageApproved, handler.clone());

        bus.publish(approved()).await;
        bus.publish(PipelineEvent::ImageRejected {
            project_id: "p1".to_string(),
            character_slug: "mira".to_string(),
            image_id: "i2".to_string(),
            timestamp: Utc::now(),
        })
        .await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new(16);
        let failing = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let ok = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        bus.register(EventKind::ImageApproved, failing);
        bus.register(EventKind::ImageApproved, ok.clone());

        let report = bus.publish(approved()).await;
        assert_eq!(report.handled, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_observers_receive_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let report = bus.publish(approved()).await;
        assert_eq!(report.observers, 1);
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::ImageApproved);
    }
}
