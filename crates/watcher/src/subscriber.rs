//! Event subscribers and batch dispatch

use crate::event::Event;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Receiver of decoded event batches
///
/// Called on the watch loop thread once per poll cycle with every event
/// decoded from that cycle's read, in kernel order. Errors and panics are
/// logged and do not affect other subscribers.
pub trait EventSubscriber: Send + Sync {
    fn add_events(&self, events: &[Event]) -> anyhow::Result<()>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&[Event]) -> anyhow::Result<()> + Send + Sync,
{
    fn add_events(&self, events: &[Event]) -> anyhow::Result<()> {
        self(events)
    }
}

/// Outcome of delivering one batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscribers that accepted the batch
    pub delivered: usize,
    /// Subscribers that returned an error or panicked
    pub failed: usize,
}

/// Insertion-ordered set of subscribers, compared by identity
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
}

/// Identity of a subscriber allocation, ignoring vtable metadata
fn identity<S: EventSubscriber + ?Sized>(subscriber: &Arc<S>) -> *const () {
    Arc::as_ptr(subscriber).cast::<()>()
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber
    ///
    /// Returns `false` if this exact subscriber is already registered.
    pub fn add(&self, subscriber: Arc<dyn EventSubscriber>) -> bool {
        let mut subscribers = self.subscribers.lock();
        let id = identity(&subscriber);
        if subscribers.iter().any(|s| identity(s) == id) {
            return false;
        }
        subscribers.push(subscriber);
        true
    }

    /// Unregister a subscriber
    ///
    /// Returns `false` if it was not registered.
    pub fn remove<S: EventSubscriber + ?Sized>(&self, subscriber: &Arc<S>) -> bool {
        let id = identity(subscriber);
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| identity(s) != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Deliver a batch to every subscriber in registration order
    ///
    /// Delivery works on a snapshot taken under the lock, so callbacks run
    /// without it and may add or remove subscribers. Such changes apply from
    /// the next batch on.
    pub fn dispatch(&self, events: &[Event]) -> DispatchReport {
        let snapshot: Vec<Arc<dyn EventSubscriber>> = self.subscribers.lock().clone();
        let mut report = DispatchReport::default();

        for subscriber in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber.add_events(events))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!("Subscriber failed to handle {} events: {:#}", events.len(), e);
                }
                Err(payload) => {
                    report.failed += 1;
                    warn!(
                        "Subscriber panicked while handling {} events: {}",
                        events.len(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
