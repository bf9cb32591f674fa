//! Event store: persistence of events and their delivery status.

use std::collections::HashMap;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::types::{EventKey, WebhookEvent, WebhookEventStatus};
use crate::{Error, Result};

/// Tracing target for event store operations.
const TRACING_TARGET: &str = "hookwire_dispatch::store";

/// Live, infinite sequence of newly created events.
pub type EventStream = BoxStream<'static, WebhookEvent>;

/// Holds events and accepts status updates from the engine.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Subscribes to events created from now on, in creation order.
    async fn subscribe_new(&self) -> Result<EventStream>;

    /// Moves an event to `status`.
    ///
    /// Implementations must apply the check and the write atomically per key
    /// and reject anything but an edge of the status lattice with
    /// [`Error::InvalidTransition`]; that rejection is what makes the
    /// `New → Delivering` claim exclusive.
    async fn set_status(&self, key: &EventKey, status: WebhookEventStatus) -> Result<()>;

    /// Returns the current status of an event.
    async fn status(&self, key: &EventKey) -> Result<Option<WebhookEventStatus>>;
}

#[derive(Debug)]
struct StoredEvent {
    event: WebhookEvent,
    history: Vec<WebhookEventStatus>,
}

#[derive(Debug, Default)]
struct StoreInner {
    events: HashMap<EventKey, StoredEvent>,
    order: Vec<EventKey>,
}

/// In-memory event store that records every status an event goes through.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<StoreInner>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WebhookEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new event and publishes it to every live subscriber.
    ///
    /// The event is stored as [`WebhookEventStatus::New`] whatever status it
    /// carries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when an event with the same key already exists.
    pub async fn insert(&self, mut event: WebhookEvent) -> Result<EventKey> {
        let key = event.key;
        event.status = WebhookEventStatus::New;

        // Held across the write and the publish so subscribers observe
        // events in the order they were stored.
        let mut subscribers = self.subscribers.lock().await;
        {
            let mut inner = self.inner.write().await;
            if inner.events.contains_key(&key) {
                return Err(Error::store("insert", format!("event {key} already exists")));
            }
            inner.events.insert(
                key,
                StoredEvent {
                    event: event.clone(),
                    history: vec![WebhookEventStatus::New],
                },
            );
            inner.order.push(key);
        }

        subscribers.retain(|tx| tx.send(event.clone()).is_ok());

        tracing::trace!(
            target: TRACING_TARGET,
            event = %key,
            subscribers = subscribers.len(),
            "Event stored"
        );

        Ok(key)
    }

    /// Returns every status the event has been in, oldest first.
    pub async fn history(&self, key: &EventKey) -> Vec<WebhookEventStatus> {
        self.inner
            .read()
            .await
            .events
            .get(key)
            .map(|stored| stored.history.clone())
            .unwrap_or_default()
    }

    /// Returns all events in insertion order.
    pub async fn snapshot(&self) -> Vec<WebhookEvent> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|key| inner.events.get(key))
            .map(|stored| stored.event.clone())
            .collect()
    }

    /// Counts events per current status.
    pub async fn count_by_status(&self) -> HashMap<WebhookEventStatus, usize> {
        let inner = self.inner.read().await;
        inner
            .events
            .values()
            .fold(HashMap::new(), |mut counts, stored| {
                *counts.entry(stored.event.status).or_default() += 1;
                counts
            })
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn subscribe_new(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn set_status(&self, key: &EventKey, status: WebhookEventStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .events
            .get_mut(key)
            .ok_or(Error::EventNotFound { key: *key })?;

        let current = stored.event.status;
        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                key: *key,
                from: current,
                to: status,
            });
        }

        stored.event.status = status;
        stored.history.push(status);
        Ok(())
    }

    async fn status(&self, key: &EventKey) -> Result<Option<WebhookEventStatus>> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .get(key)
            .map(|stored| stored.event.status))
    }
}
