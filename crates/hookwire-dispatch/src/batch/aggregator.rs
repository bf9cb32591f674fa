//! Per-key batcher tasks and their supervisor.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::task::TaskTracker;

use super::{Batch, BatchKey};
use crate::dispatch::{DispatchUnit, Dispatcher};
use crate::types::{Webhook, WebhookEvent};

/// Tracing target for batching operations.
const TRACING_TARGET: &str = "hookwire_dispatch::batch";

/// An event together with the webhook it was resolved to.
type Arrival = (Webhook, WebhookEvent);

struct KeyWorker {
    tx: mpsc::UnboundedSender<Arrival>,
    last_seen: Instant,
}

/// Routes batched events to one batcher task per [`BatchKey`].
///
/// Owned by the engine's consumer task. Dropping a key's sender is the only
/// way a batcher task ends: it then drains its queue, flushes, and exits.
pub(crate) struct BatchAggregator {
    max_batch_size: NonZeroUsize,
    max_wait_time: Duration,
    idle_ttl: Duration,
    workers: HashMap<BatchKey, KeyWorker>,
    dispatcher: Dispatcher,
    tracker: TaskTracker,
}

impl BatchAggregator {
    pub fn new(
        max_batch_size: NonZeroUsize,
        max_wait_time: Duration,
        idle_ttl: Duration,
        dispatcher: Dispatcher,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            max_batch_size,
            max_wait_time,
            idle_ttl,
            workers: HashMap::new(),
            dispatcher,
            tracker,
        }
    }

    /// Hands an event to its key's batcher, starting one if needed.
    pub fn push(&mut self, webhook: Webhook, event: WebhookEvent) {
        let key = BatchKey::of(&event);
        let now = Instant::now();
        let mut arrival = (webhook, event);

        if let Some(worker) = self.workers.get_mut(&key) {
            match worker.tx.send(arrival) {
                Ok(()) => {
                    worker.last_seen = now;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        key = %key,
                        "Batcher stopped unexpectedly, restarting"
                    );
                    arrival = returned;
                }
            }
        }

        let tx = self.spawn_batcher(key);
        if tx.send(arrival).is_err() {
            tracing::error!(
                target: TRACING_TARGET,
                key = %key,
                "Batcher stopped before receiving its first event"
            );
            return;
        }
        self.workers.insert(key, KeyWorker { tx, last_seen: now });
    }

    /// Retires every key that received nothing for the idle TTL.
    pub fn retire_idle(&mut self) {
        let now = Instant::now();
        let idle_ttl = self.idle_ttl;

        self.workers.retain(|key, worker| {
            let idle = now.saturating_duration_since(worker.last_seen);
            if idle < idle_ttl {
                return true;
            }

            tracing::debug!(
                target: TRACING_TARGET,
                key = %key,
                idle_ms = idle.as_millis() as u64,
                "Retiring idle batcher"
            );
            false
        });
    }

    /// Number of keys with a running batcher.
    pub fn active_keys(&self) -> usize {
        self.workers.len()
    }

    /// Stops every batcher; open batches are flushed right away.
    pub fn close(self) {
        tracing::debug!(
            target: TRACING_TARGET,
            active_keys = self.workers.len(),
            "Closing batchers"
        );
    }

    fn spawn_batcher(&self, key: BatchKey) -> mpsc::UnboundedSender<Arrival> {
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!(target: TRACING_TARGET, key = %key, "Starting batcher");

        self.tracker.spawn(run_batcher(
            key,
            rx,
            self.max_batch_size.get(),
            self.max_wait_time,
            self.dispatcher.clone(),
        ));
        tx
    }
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum FlushTrigger {
    Size,
    Time,
    Closed,
}

/// Collects batches for one key until its queue is closed and drained.
async fn run_batcher(
    key: BatchKey,
    mut rx: mpsc::UnboundedReceiver<Arrival>,
    max_batch_size: usize,
    max_wait_time: Duration,
    dispatcher: Dispatcher,
) {
    while let Some((webhook, first)) = rx.recv().await {
        let mut batch = Batch::open(webhook, first);
        let deadline = sleep_until(batch.opened_at() + max_wait_time);
        tokio::pin!(deadline);

        let trigger = loop {
            if batch.len() >= max_batch_size {
                break FlushTrigger::Size;
            }

            tokio::select! {
                biased;
                _ = &mut deadline => break FlushTrigger::Time,
                arrival = rx.recv() => match arrival {
                    Some((_, event)) => batch.push(event),
                    None => break FlushTrigger::Closed,
                },
            }
        };

        tracing::debug!(
            target: TRACING_TARGET,
            key = %key,
            events = batch.len(),
            trigger = %trigger,
            "Flushing batch"
        );
        dispatcher.dispatch(DispatchUnit::Batch(batch)).await;
    }

    tracing::debug!(target: TRACING_TARGET, key = %key, "Batcher stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hookwire_webhook::Headers;
    use hookwire_webhook::mock::MockClient;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::*;
    use crate::dispatch::FatalSignal;
    use crate::store::{EventStore, InMemoryEventStore};
    use crate::types::{DeliveryMode, WebhookEventStatus, WebhookId};

    const WAIT: Duration = Duration::from_secs(1);

    struct Fixture {
        store: Arc<InMemoryEventStore>,
        client: MockClient,
        tracker: TaskTracker,
        aggregator: BatchAggregator,
        webhook: Webhook,
    }

    fn fixture(max_batch_size: usize, idle_ttl: Duration) -> Fixture {
        let store = Arc::new(InMemoryEventStore::new());
        let client = MockClient::new();
        let tracker = TaskTracker::new();
        let (unclaimed, _) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            store.clone(),
            client.clone().into_service(),
            Arc::default(),
            tracker.clone(),
            FatalSignal::new(CancellationToken::new()),
            unclaimed,
        );
        let aggregator = BatchAggregator::new(
            NonZeroUsize::new(max_batch_size).unwrap(),
            WAIT,
            idle_ttl,
            dispatcher,
            tracker.clone(),
        );
        let webhook = Webhook::new(
            WebhookId::new(),
            Url::parse("https://batch.test/hook").unwrap(),
            "batch",
        )
        .with_delivery_mode(DeliveryMode::BatchedAtMostOnce);

        Fixture {
            store,
            client,
            tracker,
            aggregator,
            webhook,
        }
    }

    impl Fixture {
        async fn push_text(&mut self, content: &str) -> WebhookEvent {
            let event = WebhookEvent::new(self.webhook.id, content, Headers::new());
            self.store.insert(event.clone()).await.unwrap();
            self.aggregator.push(self.webhook.clone(), event.clone());
            event
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_size() {
        let mut fixture = fixture(2, Duration::from_secs(60));
        fixture.push_text("a").await;
        fixture.push_text("b").await;
        fixture.push_text("c").await;

        assert_eq!(fixture.client.wait_for_requests(1, Duration::from_millis(10)).await, 1);
        assert_eq!(fixture.client.requests().await[0].content, "ab");
        assert_eq!(fixture.aggregator.active_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_time() {
        let mut fixture = fixture(10, Duration::from_secs(60));
        fixture.push_text("a").await;

        tokio::time::sleep(WAIT / 2).await;
        assert!(fixture.client.requests().await.is_empty());

        tokio::time::sleep(WAIT).await;
        let requests = fixture.client.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_open_batch() {
        let mut fixture = fixture(10, Duration::from_secs(60));
        let first = fixture.push_text("a").await;
        let second = fixture.push_text("b").await;

        fixture.aggregator.close();
        fixture.tracker.close();
        fixture.tracker.wait().await;

        assert_eq!(fixture.client.requests().await.len(), 1);
        for event in [first, second] {
            assert_eq!(
                fixture.store.status(&event.key).await.unwrap(),
                Some(WebhookEventStatus::Delivered)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_key_is_retired_and_restarted() {
        let mut fixture = fixture(10, WAIT * 2);
        fixture.push_text("a").await;

        tokio::time::sleep(WAIT * 3).await;
        fixture.aggregator.retire_idle();
        assert_eq!(fixture.aggregator.active_keys(), 0);

        fixture.push_text("b").await;
        assert_eq!(fixture.aggregator.active_keys(), 1);
        tokio::time::sleep(WAIT * 2).await;

        let contents: Vec<_> = fixture
            .client
            .requests()
            .await
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, ["a", "b"]);
    }
}
