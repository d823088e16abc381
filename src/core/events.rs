//! In-process publish/subscribe for domain events.
//!
//! Delivery is synchronous, at-most-once, and unpersisted. An event emitted
//! while nobody is subscribed is simply lost. `emit` never fails: a handler
//! error or panic is logged against that handler and delivery continues.
//!
//! The bus is an ordinary value. Construct one and inject it where needed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::domain::{DomainEvent, DomainEventType};

/// Handle returned by `subscribe`, used to unsubscribe
pub type SubscriptionId = u64;

/// A synchronous subscriber
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DomainEvent) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&DomainEvent) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: &DomainEvent) -> Result<()> {
        self(event)
    }
}

/// Which events a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Only(Vec<DomainEventType>),
}

impl EventFilter {
    pub fn only(types: &[DomainEventType]) -> Self {
        Self::Only(types.to_vec())
    }

    pub fn matches(&self, event_type: DomainEventType) -> bool {
        match self {
            Self::All => true,
            Self::Only(types) => types.contains(&event_type),
        }
    }
}

/// Delivery summary of one `emit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
enum Sink {
    Handler(Arc<dyn EventHandler>),
    Channel(mpsc::UnboundedSender<DomainEvent>),
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    name: String,
    filter: EventFilter,
    sink: Sink,
}

/// Domain event bus
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler
    pub fn subscribe<H>(&self, name: &str, filter: EventFilter, handler: H) -> SubscriptionId
    where
        H: EventHandler + 'static,
    {
        self.add(name, filter, Sink::Handler(Arc::new(handler)))
    }

    /// Register a channel subscriber for async consumers.
    ///
    /// Dropping the receiver ends the subscription on the next emit.
    pub fn subscribe_channel(
        &self,
        name: &str,
        filter: EventFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add(name, filter, Sink::Channel(tx));
        (id, rx)
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver an event to every matching subscriber
    pub fn emit(&self, event: &DomainEvent) -> EmitReport {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.filter.matches(event.event_type))
            .cloned()
            .collect();

        let mut report = EmitReport::default();
        let mut closed = Vec::new();

        for sub in &targets {
            let outcome = match &sub.sink {
                Sink::Handler(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("handler panicked")),
                    }
                }
                Sink::Channel(tx) => tx.send(event.clone()).map_err(|_| {
                    closed.push(sub.id);
                    anyhow::anyhow!("receiver dropped")
                }),
            };

            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        subscriber = %sub.name,
                        event_type = ?event.event_type,
                        event_id = %event.id,
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }

        for id in closed {
            warn!(subscription = id, "Dropping closed channel subscription");
            self.unsubscribe(id);
        }

        if targets.is_empty() {
            debug!(event_type = ?event.event_type, "Event emitted with no subscribers");
        }

        report
    }

    fn add(&self, name: &str, filter: EventFilter, sink: Sink) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscription {
                id,
                name: name.to_string(),
                filter,
                sink,
            });
        id
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Actor;
    use std::sync::Mutex;

    fn event(event_type: DomainEventType) -> DomainEvent {
        DomainEvent::new(event_type, "42:7", Actor::student(42))
    }

    #[test]
    fn test_emit_without_subscribers_is_lost() {
        let bus = EventBus::new();
        let report = bus.emit(&event(DomainEventType::EnrollmentCreated));
        assert_eq!(report, EmitReport::default());
    }

    #[test]
    fn test_failing_handler_does_not_affect_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("broken", EventFilter::All, |_: &DomainEvent| -> Result<()> {
            anyhow::bail!("socket closed")
        });
        bus.subscribe("panicky", EventFilter::All, |_: &DomainEvent| -> Result<()> {
            panic!("handler bug")
        });
        let sink = seen.clone();
        bus.subscribe("recorder", EventFilter::All, move |e: &DomainEvent| -> Result<()> {
            sink.lock().unwrap().push(e.event_type);
            Ok(())
        });

        let report = bus.emit(&event(DomainEventType::ProgressUpdated));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(*seen.lock().unwrap(), vec![DomainEventType::ProgressUpdated]);
    }

    #[test]
    fn test_filter_and_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let id = bus.subscribe(
            "enrollments",
            EventFilter::only(&[DomainEventType::EnrollmentCreated]),
            move |_: &DomainEvent| -> Result<()> {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        bus.emit(&event(DomainEventType::EnrollmentCreated));
        bus.emit(&event(DomainEventType::RequestCreated));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&event(DomainEventType::EnrollmentCreated));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_subscriber() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel("realtime", EventFilter::All);

        bus.emit(&event(DomainEventType::EnrollmentRemoved));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, DomainEventType::EnrollmentRemoved);

        drop(rx);
        let report = bus.emit(&event(DomainEventType::EnrollmentRemoved));
        assert_eq!(report.failed, 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
