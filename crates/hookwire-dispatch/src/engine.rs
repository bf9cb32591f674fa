//! The dispatch engine and its running handle.
//!
//! One consumer task reads the store's new-event subscription. For every event
//! it resolves the webhook, then either dispatches the event on its own or
//! hands it to the [`BatchAggregator`]. Requests themselves run on tracked
//! tasks so one slow destination never holds up the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use hookwire_webhook::WebhookService;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::batch::BatchAggregator;
use crate::config::{BatchingConfig, DispatchConfig};
use crate::directory::WebhookDirectory;
use crate::dispatch::{DispatchUnit, Dispatcher, FatalSignal};
use crate::error::WebhookError;
use crate::stats::{DispatchStats, DispatchStatsSnapshot};
use crate::store::{EventStore, EventStream};
use crate::types::{DeliveryMode, WebhookEvent, WebhookId};
use crate::{Error, Result};

/// Tracing target for engine operations.
const TRACING_TARGET: &str = "hookwire_dispatch::engine";

/// Shortest period of the idle batcher sweep.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Dispatch engine, configured but not yet running.
///
/// # Example
///
/// ```rust,ignore
/// let engine = DispatchEngine::new(directory, store, client, DispatchConfig::default());
/// let mut errors = engine.subscribe_errors();
/// let handle = engine.start().await?;
/// // ...
/// handle.shutdown().await?;
/// ```
pub struct DispatchEngine {
    directory: Arc<dyn WebhookDirectory>,
    store: Arc<dyn EventStore>,
    client: WebhookService,
    config: DispatchConfig,
    errors: broadcast::Sender<WebhookError>,
}

impl DispatchEngine {
    pub fn new(
        directory: Arc<dyn WebhookDirectory>,
        store: Arc<dyn EventStore>,
        client: WebhookService,
        config: DispatchConfig,
    ) -> Self {
        // A zero capacity is rejected by `start`.
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));

        Self {
            directory,
            store,
            client,
            config,
            errors,
        }
    }

    /// Subscribes to operational errors.
    ///
    /// Subscribe before [`start`](Self::start) to observe every error.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<WebhookError> {
        self.errors.subscribe()
    }

    /// Subscribes to the event store and starts dispatching.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration, or the
    /// store's error when the subscription cannot be created.
    pub async fn start(self) -> Result<DispatchHandle> {
        self.config.validate()?;
        let events = self.store.subscribe_new().await?;

        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let stats = Arc::new(DispatchStats::default());
        let fatal = FatalSignal::new(cancel.clone());
        let (unclaimed_tx, unclaimed_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            self.store,
            self.client,
            stats.clone(),
            tracker.clone(),
            fatal.clone(),
            unclaimed_tx,
        );

        let idle_ttl = self.config.effective_idle_ttl();
        let aggregator = match self.config.batching {
            BatchingConfig::Disabled => None,
            BatchingConfig::Enabled {
                max_batch_size,
                max_wait_time,
            } => Some(BatchAggregator::new(
                max_batch_size,
                max_wait_time,
                idle_ttl,
                dispatcher.clone(),
                tracker.clone(),
            )),
        };

        tracing::info!(
            target: TRACING_TARGET,
            batching = aggregator.is_some(),
            idle_ttl_ms = idle_ttl.as_millis() as u64,
            max_parked = self.config.max_parked,
            shutdown_timeout_secs = self.config.shutdown_timeout.as_secs(),
            "Starting dispatch engine"
        );

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let consumer = Consumer {
            directory: self.directory,
            dispatcher,
            aggregator,
            errors: self.errors.clone(),
            stats: stats.clone(),
            parked: HashMap::new(),
            parked_len: 0,
            max_parked: self.config.max_parked,
        };
        let channels = ConsumerChannels {
            events,
            commands: commands_rx,
            unclaimed: unclaimed_rx,
        };
        let sweep_interval = (idle_ttl / 2).max(MIN_SWEEP_INTERVAL);
        let task = tokio::spawn(consumer.run(
            channels,
            sweep_interval,
            stop.clone(),
            cancel.clone(),
        ));

        Ok(DispatchHandle {
            cancel,
            stop,
            tracker,
            consumer: task,
            commands: commands_tx,
            errors: self.errors,
            stats,
            fatal,
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}

/// Requests from the handle to the consumer task.
enum Command {
    ReleaseParked {
        webhook_id: WebhookId,
        reply: oneshot::Sender<usize>,
    },
    ParkedCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a running [`DispatchEngine`].
pub struct DispatchHandle {
    /// Cancelled once the consumer stops, whatever the cause.
    cancel: CancellationToken,
    /// Graceful stop requested through the handle.
    stop: CancellationToken,
    tracker: TaskTracker,
    consumer: JoinHandle<()>,
    commands: mpsc::Sender<Command>,
    errors: broadcast::Sender<WebhookError>,
    stats: Arc<DispatchStats>,
    fatal: FatalSignal,
    shutdown_timeout: Duration,
}

impl DispatchHandle {
    /// Subscribes to operational errors emitted from now on.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<WebhookError> {
        self.errors.subscribe()
    }

    /// Returns the current dispatch counters.
    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Re-resolves the parked events of one webhook, in creation order.
    ///
    /// Events whose webhook is now enabled are dispatched; the others stay
    /// parked and are not reported on the error channel again. Returns the
    /// number of events that left the parked set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] when the engine is no longer running.
    pub async fn release_parked(&self, webhook_id: WebhookId) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::ReleaseParked { webhook_id, reply })
            .await?;
        response.await.map_err(|_| Error::Shutdown)
    }

    /// Returns the number of parked events across all webhooks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] when the engine is no longer running.
    pub async fn parked_count(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::ParkedCount { reply }).await?;
        response.await.map_err(|_| Error::Shutdown)
    }

    /// Returns whether the engine still consumes events.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Completes once the engine stops consuming events.
    ///
    /// That happens on [`shutdown`](Self::shutdown), when the event
    /// subscription ends, or after a fatal error.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    /// Stops the engine and waits for in-flight deliveries.
    ///
    /// Events the subscription already yielded but the engine has not read
    /// yet are routed first; nothing new is awaited. Open batches are then
    /// flushed immediately. Waits at most the configured shutdown timeout for
    /// requests in flight.
    ///
    /// # Errors
    ///
    /// Returns the internal invariant violation that stopped the engine, if any.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!(target: TRACING_TARGET, "Shutting down dispatch engine");
        self.stop.cancel();

        if let Err(err) = self.consumer.await {
            tracing::error!(
                target: TRACING_TARGET,
                error = %err,
                "Consumer task terminated abnormally"
            );
        }

        self.tracker.close();
        if tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                target: TRACING_TARGET,
                pending_tasks = self.tracker.len(),
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Shutdown timed out with deliveries in flight"
            );
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            target: TRACING_TARGET,
            events_observed = stats.events_observed,
            requests_sent = stats.requests_sent,
            events_delivered = stats.events_delivered,
            events_failed = stats.events_failed,
            "Dispatch engine stopped"
        );

        match self.fatal.take().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        if self.cancel.is_cancelled() || self.stop.is_cancelled() {
            return Err(Error::Shutdown);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Shutdown)
    }
}

/// State owned by the consumer task.
struct Consumer {
    directory: Arc<dyn WebhookDirectory>,
    dispatcher: Dispatcher,
    aggregator: Option<BatchAggregator>,
    errors: broadcast::Sender<WebhookError>,
    stats: Arc<DispatchStats>,
    /// Events left `New`, per webhook, in creation order.
    parked: HashMap<WebhookId, Vec<WebhookEvent>>,
    parked_len: usize,
    max_parked: usize,
}

/// Inputs read by the consumer task.
struct ConsumerChannels {
    events: EventStream,
    commands: mpsc::Receiver<Command>,
    /// Members of abandoned dispatch units, still `New`.
    unclaimed: mpsc::UnboundedReceiver<WebhookEvent>,
}

/// How an event reached [`Consumer::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Subscription,
    Release,
}

impl Consumer {
    async fn run(
        mut self,
        channels: ConsumerChannels,
        sweep_interval: Duration,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) {
        let ConsumerChannels {
            mut events,
            mut commands,
            mut unclaimed,
        } = channels;
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(target: TRACING_TARGET, "Consumer cancelled");
                    break;
                }
                _ = stop.cancelled() => {
                    tracing::debug!(target: TRACING_TARGET, "Consumer shutdown requested");
                    self.drain_queued(&mut events, &cancel).await;
                    break;
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = unclaimed.recv() => {
                    tracing::debug!(
                        target: TRACING_TARGET,
                        event = %event.key,
                        "Parking event of an abandoned dispatch"
                    );
                    self.park(event);
                }
                event = events.next() => match event {
                    Some(event) => {
                        self.stats.record_observed();
                        self.route(event, Origin::Subscription).await;
                    }
                    None => {
                        tracing::warn!(target: TRACING_TARGET, "Event subscription ended");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    if let Some(aggregator) = self.aggregator.as_mut() {
                        aggregator.retire_idle();
                        tracing::trace!(
                            target: TRACING_TARGET,
                            active_keys = aggregator.active_keys(),
                            "Swept idle batchers"
                        );
                    }
                }
            }
        }

        if let Some(aggregator) = self.aggregator.take() {
            aggregator.close();
        }

        while let Ok(event) = unclaimed.try_recv() {
            self.park(event);
        }
        if self.parked_len > 0 {
            tracing::info!(
                target: TRACING_TARGET,
                parked = self.parked_len,
                "Stopping with parked events left as new"
            );
        }
        cancel.cancel();
    }

    /// Routes every event the subscription can yield without waiting.
    async fn drain_queued(&mut self, events: &mut EventStream, cancel: &CancellationToken) {
        let mut drained = 0usize;
        while !cancel.is_cancelled() {
            let Some(Some(event)) = events.next().now_or_never() else {
                break;
            };
            self.stats.record_observed();
            self.route(event, Origin::Subscription).await;
            drained += 1;
        }

        tracing::debug!(target: TRACING_TARGET, drained, "Drained queued events");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ReleaseParked { webhook_id, reply } => {
                let released = self.release(webhook_id).await;
                let _ = reply.send(released);
            }
            Command::ParkedCount { reply } => {
                let _ = reply.send(self.parked_len);
            }
        }
    }

    async fn release(&mut self, webhook_id: WebhookId) -> usize {
        let Some(events) = self.parked.remove(&webhook_id) else {
            return 0;
        };

        let before = events.len();
        self.parked_len -= before;
        for event in events {
            self.route(event, Origin::Release).await;
        }
        let after = self.parked.get(&webhook_id).map_or(0, Vec::len);

        tracing::info!(
            target: TRACING_TARGET,
            webhook_id = %webhook_id,
            released = before - after,
            still_parked = after,
            "Released parked events"
        );
        before - after
    }

    /// Resolves the event's webhook and applies its delivery policy.
    async fn route(&mut self, event: WebhookEvent, origin: Origin) {
        let webhook_id = event.webhook_id();

        let webhook = match self.directory.lookup(&webhook_id).await {
            Ok(Some(webhook)) => webhook,
            Ok(None) => {
                if origin == Origin::Subscription {
                    self.report_missing(webhook_id, &event);
                }
                self.park(event);
                return;
            }
            Err(err) => {
                tracing::error!(
                    target: TRACING_TARGET,
                    webhook_id = %webhook_id,
                    event = %event.key,
                    error = %err,
                    "Webhook lookup failed, parking event"
                );
                self.park(event);
                return;
            }
        };

        if !webhook.status.is_enabled() {
            tracing::debug!(
                target: TRACING_TARGET,
                webhook_id = %webhook_id,
                event = %event.key,
                status = ?webhook.status,
                "Webhook not enabled, parking event"
            );
            self.park(event);
            return;
        }

        match (webhook.delivery_mode, self.aggregator.as_mut()) {
            (DeliveryMode::BatchedAtMostOnce, Some(aggregator)) => {
                aggregator.push(webhook, event);
            }
            _ => {
                self.dispatcher
                    .dispatch(DispatchUnit::Single { webhook, event })
                    .await;
            }
        }
    }

    fn report_missing(&self, webhook_id: WebhookId, event: &WebhookEvent) {
        tracing::warn!(
            target: TRACING_TARGET,
            webhook_id = %webhook_id,
            event = %event.key,
            "Event references an unknown webhook"
        );

        self.stats.record_missing_webhook();
        if self
            .errors
            .send(WebhookError::MissingWebhook { webhook_id })
            .is_err()
        {
            tracing::trace!(target: TRACING_TARGET, "No error channel subscribers");
        }
    }

    /// Keeps the event for a later release, unless the parked set is full.
    fn park(&mut self, event: WebhookEvent) {
        if self.parked_len >= self.max_parked {
            tracing::warn!(
                target: TRACING_TARGET,
                event = %event.key,
                max_parked = self.max_parked,
                "Parked set full, event left new without parking"
            );
            self.stats.record_dropped();
            return;
        }

        self.stats.record_parked();
        self.parked_len += 1;
        self.parked
            .entry(event.webhook_id())
            .or_default()
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;
    use hookwire_webhook::Headers;
    use hookwire_webhook::mock::MockClient;
    use jiff::Timestamp;
    use url::Url;

    use super::*;
    use crate::directory::InMemoryWebhookDirectory;
    use crate::store::InMemoryEventStore;
    use crate::types::{EventKey, Webhook, WebhookEventStatus, WebhookStatus};

    const SETTLE: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(1);

    struct Harness {
        directory: Arc<InMemoryWebhookDirectory>,
        store: Arc<InMemoryEventStore>,
        client: MockClient,
        errors: broadcast::Receiver<WebhookError>,
        handle: DispatchHandle,
    }

    async fn start(config: DispatchConfig, client: MockClient, webhooks: &[Webhook]) -> Harness {
        let directory = Arc::new(InMemoryWebhookDirectory::from_webhooks(webhooks.to_vec()));
        let store = Arc::new(InMemoryEventStore::new());
        let engine = DispatchEngine::new(
            directory.clone(),
            store.clone(),
            client.clone().into_service(),
            config,
        );
        let errors = engine.subscribe_errors();
        let handle = engine.start().await.unwrap();

        Harness {
            directory,
            store,
            client,
            errors,
            handle,
        }
    }

    fn batching(max_batch_size: usize) -> DispatchConfig {
        DispatchConfig::new(BatchingConfig::enabled(max_batch_size, WAIT).unwrap())
    }

    fn webhook(name: &str) -> Webhook {
        let url = Url::parse(&format!("https://{name}.test/hook")).unwrap();
        Webhook::new(WebhookId::new(), url, name)
    }

    fn batched(name: &str) -> Webhook {
        webhook(name).with_delivery_mode(DeliveryMode::BatchedAtMostOnce)
    }

    impl Harness {
        async fn publish(
            &self,
            webhook_id: WebhookId,
            content: &str,
            content_type: &str,
        ) -> EventKey {
            let headers = Headers::new().with("Content-Type", content_type);
            let event = WebhookEvent::new(webhook_id, content, headers);
            self.store.insert(event).await.unwrap()
        }

        async fn publish_json(&self, webhook_id: WebhookId, content: &str) -> EventKey {
            self.publish(webhook_id, content, "application/json").await
        }

        async fn status(&self, key: &EventKey) -> Option<WebhookEventStatus> {
            self.store.status(key).await.unwrap()
        }

        /// Lets every task run until all of them wait on the clock.
        async fn settle(&self) {
            tokio::time::sleep(SETTLE).await;
        }

        async fn drain_errors(&mut self) -> Vec<WebhookError> {
            let mut errors = Vec::new();
            while let Ok(error) = self.errors.try_recv() {
                errors.push(error);
            }
            errors
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_delivery_succeeds() {
        let hook = webhook("single");
        let harness = start(DispatchConfig::default(), MockClient::new(), &[hook.clone()]).await;

        let key = harness.publish_json(hook.id, r#"{"n":1}"#).await;
        harness.settle().await;

        assert_eq!(
            harness.store.history(&key).await,
            [
                WebhookEventStatus::New,
                WebhookEventStatus::Delivering,
                WebhookEventStatus::Delivered
            ]
        );
        let requests = harness.client.requests_to(&hook.url).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content, r#"{"n":1}"#);
        assert_eq!(requests[0].headers.content_type(), Some("application/json"));

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_ok_status_and_transport_error_fail() {
        let rejecting = webhook("rejecting");
        let accepted = webhook("accepted");
        let unreachable = webhook("unreachable");
        let client = MockClient::new()
            .with_status_for(rejecting.url.clone(), 500)
            .with_status_for(accepted.url.clone(), 202)
            .with_transport_error_for(unreachable.url.clone());
        let harness = start(
            DispatchConfig::default(),
            client,
            &[rejecting.clone(), accepted.clone(), unreachable.clone()],
        )
        .await;

        let mut keys = Vec::new();
        for hook in [&rejecting, &accepted, &unreachable] {
            keys.push(harness.publish(hook.id, "payload", "text/plain").await);
        }
        harness.settle().await;

        for key in &keys {
            assert_eq!(
                harness.store.history(key).await,
                [
                    WebhookEventStatus::New,
                    WebhookEventStatus::Delivering,
                    WebhookEventStatus::Failed
                ]
            );
        }
        assert_eq!(harness.client.requests().await.len(), 3);
        assert_eq!(harness.handle.stats().events_failed, 3);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_and_unavailable_webhooks_get_no_requests() {
        let disabled = webhook("disabled").with_status(WebhookStatus::Disabled);
        let unavailable = webhook("unavailable").with_status(WebhookStatus::Unavailable {
            since: Timestamp::now(),
        });
        let harness = start(
            DispatchConfig::default(),
            MockClient::new(),
            &[disabled.clone(), unavailable.clone()],
        )
        .await;

        let first = harness.publish_json(disabled.id, "{}").await;
        let second = harness.publish_json(unavailable.id, "{}").await;
        harness.settle().await;

        assert!(harness.client.requests().await.is_empty());
        assert_eq!(harness.status(&first).await, Some(WebhookEventStatus::New));
        assert_eq!(harness.status(&second).await, Some(WebhookEventStatus::New));
        assert_eq!(harness.handle.parked_count().await.unwrap(), 2);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_webhook_reports_every_event() {
        let mut harness = start(DispatchConfig::default(), MockClient::new(), &[]).await;
        let unknown = WebhookId::new();

        let mut keys = Vec::new();
        for n in 0..3 {
            keys.push(harness.publish_json(unknown, &format!("{{\"n\":{n}}}")).await);
        }
        harness.settle().await;

        let errors = harness.drain_errors().await;
        assert_eq!(
            errors,
            vec![WebhookError::MissingWebhook { webhook_id: unknown }; 3]
        );
        for key in &keys {
            assert_eq!(harness.status(key).await, Some(WebhookEventStatus::New));
        }
        assert!(harness.client.requests().await.is_empty());
        assert!(harness.handle.is_running());
        assert_eq!(harness.handle.stats().missing_webhook, 3);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_batching_sends_one_request_per_full_batch() {
        let hook = batched("sized");
        let harness = start(batching(3), MockClient::new(), &[hook.clone()]).await;

        let mut keys = Vec::new();
        for n in 0..6 {
            keys.push(harness.publish_json(hook.id, &format!("{{\"n\":{n}}}")).await);
        }
        harness.settle().await;

        let requests = harness.client.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].content, r#"[{"n":0},{"n":1},{"n":2}]"#);
        assert_eq!(requests[1].content, r#"[{"n":3},{"n":4},{"n":5}]"#);
        for key in &keys {
            assert_eq!(
                harness.status(key).await,
                Some(WebhookEventStatus::Delivered)
            );
        }
        assert_eq!(harness.handle.stats().batches_flushed, 2);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_batching_flushes_after_max_wait() {
        let hook = batched("timed");
        let harness = start(batching(10), MockClient::new(), &[hook.clone()]).await;

        for n in 0..3 {
            harness.publish_json(hook.id, &format!("{{\"n\":{n}}}")).await;
        }
        tokio::time::sleep(WAIT - SETTLE).await;
        assert!(harness.client.requests().await.is_empty());

        tokio::time::sleep(SETTLE * 2).await;
        let requests = harness.client.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content, r#"[{"n":0},{"n":1},{"n":2}]"#);

        harness.handle.shutdown().await.unwrap();
        assert_eq!(harness.client.requests().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_categories_never_share_a_batch() {
        let hook = batched("mixed");
        let harness = start(batching(10), MockClient::new(), &[hook.clone()]).await;

        harness.publish_json(hook.id, r#"{"event":"payload0"}"#).await;
        harness.publish(hook.id, "event payload 0", "text/plain").await;
        harness.publish_json(hook.id, r#"{"event":"payload1"}"#).await;
        harness.publish(hook.id, "event payload 1", "text/plain").await;
        tokio::time::sleep(WAIT + SETTLE).await;

        let mut contents: Vec<_> = harness
            .client
            .requests()
            .await
            .into_iter()
            .map(|r| r.content)
            .collect();
        contents.sort();
        assert_eq!(
            contents,
            [
                r#"[{"event":"payload0"},{"event":"payload1"}]"#,
                "event payload 0event payload 1",
            ]
        );

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_webhook_without_batching_is_sent_singly() {
        let hook = batched("unbatched");
        let harness = start(DispatchConfig::default(), MockClient::new(), &[hook.clone()]).await;

        for n in 0..4 {
            harness.publish_json(hook.id, &format!("{{\"n\":{n}}}")).await;
        }
        harness.settle().await;

        let contents: Vec<_> = harness
            .client
            .requests()
            .await
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, [r#"{"n":0}"#, r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_request_per_single_webhook() {
        let hooks: Vec<_> = (0..5).map(|n| webhook(&format!("hook{n}"))).collect();
        let harness = start(batching(10), MockClient::new(), &hooks).await;

        for hook in &hooks {
            harness.publish_json(hook.id, "{}").await;
        }
        harness.settle().await;

        for hook in &hooks {
            assert_eq!(harness.client.requests_to(&hook.url).await.len(), 1);
        }
        assert_eq!(harness.handle.stats().requests_sent, 5);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_parked_after_registration() {
        let hook = webhook("late");
        let mut harness = start(DispatchConfig::default(), MockClient::new(), &[]).await;

        let first = harness.publish_json(hook.id, r#"{"n":0}"#).await;
        let second = harness.publish_json(hook.id, r#"{"n":1}"#).await;
        harness.settle().await;
        assert_eq!(harness.handle.parked_count().await.unwrap(), 2);

        // Still unknown: nothing leaves and nothing is reported twice.
        assert_eq!(harness.handle.release_parked(hook.id).await.unwrap(), 0);
        assert_eq!(harness.drain_errors().await.len(), 2);

        harness.directory.insert(hook.clone()).await;
        assert_eq!(harness.handle.release_parked(hook.id).await.unwrap(), 2);
        harness.settle().await;

        let contents: Vec<_> = harness
            .client
            .requests()
            .await
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, [r#"{"n":0}"#, r#"{"n":1}"#]);
        assert_eq!(harness.status(&first).await, Some(WebhookEventStatus::Delivered));
        assert_eq!(harness.status(&second).await, Some(WebhookEventStatus::Delivered));
        assert!(harness.drain_errors().await.is_empty());
        assert_eq!(harness.handle.parked_count().await.unwrap(), 0);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_parked_after_enabling() {
        let hook = webhook("paused").with_status(WebhookStatus::Disabled);
        let harness = start(DispatchConfig::default(), MockClient::new(), &[hook.clone()]).await;

        let key = harness.publish_json(hook.id, "{}").await;
        harness.settle().await;
        assert!(harness.client.requests().await.is_empty());

        harness
            .directory
            .set_status(&hook.id, WebhookStatus::Enabled)
            .await;
        // Enabling alone does not re-evaluate parked events.
        harness.settle().await;
        assert!(harness.client.requests().await.is_empty());

        assert_eq!(harness.handle.release_parked(hook.id).await.unwrap(), 1);
        assert_eq!(harness.handle.release_parked(WebhookId::new()).await.unwrap(), 0);
        harness.settle().await;
        assert_eq!(harness.status(&key).await, Some(WebhookEventStatus::Delivered));

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_json_member_fails_whole_batch() {
        let hook = batched("invalid");
        let harness = start(batching(3), MockClient::new(), &[hook.clone()]).await;

        let keys = [
            harness.publish_json(hook.id, "{}").await,
            harness.publish_json(hook.id, "{not json").await,
            harness.publish_json(hook.id, "[]").await,
        ];
        harness.settle().await;

        assert!(harness.client.requests().await.is_empty());
        for key in &keys {
            assert_eq!(
                harness.store.history(key).await,
                [
                    WebhookEventStatus::New,
                    WebhookEventStatus::Delivering,
                    WebhookEventStatus::Failed
                ]
            );
        }

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_open_batches() {
        let hook = batched("open");
        let config = DispatchConfig::new(
            BatchingConfig::enabled(10, Duration::from_secs(3600)).unwrap(),
        );
        let harness = start(config, MockClient::new(), &[hook.clone()]).await;

        let first = harness.publish(hook.id, "a", "text/plain").await;
        let second = harness.publish(hook.id, "b", "text/plain").await;
        harness.settle().await;
        assert!(harness.client.requests().await.is_empty());

        let Harness {
            store,
            client,
            handle,
            ..
        } = harness;
        handle.shutdown().await.unwrap();

        let requests = client.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content, "ab");
        for key in [first, second] {
            assert_eq!(
                store.status(&key).await.unwrap(),
                Some(WebhookEventStatus::Delivered)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_routes_queued_events() {
        let single = webhook("queued-single");
        let grouped = batched("queued-batched");
        let webhooks = [single.clone(), grouped.clone()];
        let harness = start(batching(7), MockClient::new(), &webhooks).await;

        for n in 0..100 {
            harness.publish_json(single.id, &format!("{{\"n\":{n}}}")).await;
            harness.publish_json(grouped.id, &format!("{{\"n\":{n}}}")).await;
        }

        let Harness {
            store,
            client,
            handle,
            ..
        } = harness;
        handle.shutdown().await.unwrap();

        let counts = store.count_by_status().await;
        assert_eq!(counts.get(&WebhookEventStatus::New), None);
        assert_eq!(counts.get(&WebhookEventStatus::Delivered), Some(&200));
        assert_eq!(client.requests_to(&single.url).await.len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_set_is_bounded() {
        let hook = webhook("bounded").with_status(WebhookStatus::Disabled);
        let config = DispatchConfig::default().with_max_parked(2);
        let harness = start(config, MockClient::new(), &[hook.clone()]).await;

        let keys = [
            harness.publish_json(hook.id, r#"{"n":0}"#).await,
            harness.publish_json(hook.id, r#"{"n":1}"#).await,
            harness.publish_json(hook.id, r#"{"n":2}"#).await,
        ];
        harness.settle().await;

        assert_eq!(harness.handle.parked_count().await.unwrap(), 2);
        let stats = harness.handle.stats();
        assert_eq!(stats.events_parked, 2);
        assert_eq!(stats.events_dropped, 1);

        harness
            .directory
            .set_status(&hook.id, WebhookStatus::Enabled)
            .await;
        assert_eq!(harness.handle.release_parked(hook.id).await.unwrap(), 2);
        harness.settle().await;

        let contents: Vec<_> = harness
            .client
            .requests()
            .await
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, [r#"{"n":0}"#, r#"{"n":1}"#]);
        assert_eq!(harness.status(&keys[2]).await, Some(WebhookEventStatus::New));
        assert_eq!(harness.handle.parked_count().await.unwrap(), 0);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_retirement_loses_no_events() {
        let hook = batched("idle");
        let config = batching(10).with_idle_ttl(Duration::from_millis(1));
        let harness = start(config, MockClient::new(), &[hook.clone()]).await;

        let mut keys = Vec::new();
        for round in 0..3 {
            keys.push(harness.publish(hook.id, &format!("r{round}"), "text/plain").await);
            tokio::time::sleep(WAIT * 5).await;
        }

        let contents: Vec<_> = harness
            .client
            .requests()
            .await
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, ["r0", "r1", "r2"]);
        for key in &keys {
            assert_eq!(harness.status(key).await, Some(WebhookEventStatus::Delivered));
        }

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_in_flight_complete_on_shutdown() {
        let hook = webhook("slow");
        let client = MockClient::new().with_latency(Duration::from_secs(5));
        let harness = start(DispatchConfig::default(), client, &[hook.clone()]).await;

        let key = harness.publish_json(hook.id, "{}").await;
        harness.settle().await;
        assert_eq!(harness.status(&key).await, Some(WebhookEventStatus::Delivering));

        let Harness { store, handle, .. } = harness;
        handle.shutdown().await.unwrap();
        assert_eq!(
            store.status(&key).await.unwrap(),
            Some(WebhookEventStatus::Delivered)
        );
    }

    /// Store whose subscription yields every event twice.
    struct DuplicatingStore(InMemoryEventStore);

    #[async_trait::async_trait]
    impl EventStore for DuplicatingStore {
        async fn subscribe_new(&self) -> Result<EventStream> {
            let events = self.0.subscribe_new().await?;
            Ok(events
                .flat_map(|event| stream::iter([event.clone(), event]))
                .boxed())
        }

        async fn set_status(&self, key: &EventKey, status: WebhookEventStatus) -> Result<()> {
            self.0.set_status(key, status).await
        }

        async fn status(&self, key: &EventKey) -> Result<Option<WebhookEventStatus>> {
            self.0.status(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_claim_stops_engine() {
        let hook = webhook("twice");
        let client = MockClient::new();
        let store = Arc::new(DuplicatingStore(InMemoryEventStore::new()));
        let engine = DispatchEngine::new(
            Arc::new(InMemoryWebhookDirectory::from_webhooks([hook.clone()])),
            store.clone(),
            client.clone().into_service(),
            DispatchConfig::default(),
        );
        let handle = engine.start().await.unwrap();

        let key = store
            .0
            .insert(WebhookEvent::new(hook.id, "{}", Headers::new()))
            .await
            .unwrap();
        handle.stopped().await;

        assert!(!handle.is_running());
        assert!(matches!(
            handle.release_parked(hook.id).await,
            Err(Error::Shutdown)
        ));
        assert!(matches!(
            handle.shutdown().await,
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(client.requests().await.len(), 1);
        assert_eq!(
            store.0.status(&key).await.unwrap(),
            Some(WebhookEventStatus::Delivered)
        );
    }

    /// Store whose `nth` claim fails with a recoverable store error.
    struct FlakyStore {
        inner: InMemoryEventStore,
        claims: AtomicUsize,
        nth: usize,
    }

    #[async_trait::async_trait]
    impl EventStore for FlakyStore {
        async fn subscribe_new(&self) -> Result<EventStream> {
            self.inner.subscribe_new().await
        }

        async fn set_status(&self, key: &EventKey, status: WebhookEventStatus) -> Result<()> {
            if status == WebhookEventStatus::Delivering
                && self.claims.fetch_add(1, Ordering::SeqCst) + 1 == self.nth
            {
                return Err(Error::store("set_status", "connection reset"));
            }
            self.inner.set_status(key, status).await
        }

        async fn status(&self, key: &EventKey) -> Result<Option<WebhookEventStatus>> {
            self.inner.status(key).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_claim_parks_unclaimed_members() {
        let hook = batched("flaky");
        let client = MockClient::new();
        let store = Arc::new(FlakyStore {
            inner: InMemoryEventStore::new(),
            claims: AtomicUsize::new(0),
            nth: 2,
        });
        let engine = DispatchEngine::new(
            Arc::new(InMemoryWebhookDirectory::from_webhooks([hook.clone()])),
            store.clone(),
            client.clone().into_service(),
            batching(3),
        );
        let handle = engine.start().await.unwrap();

        let mut keys = Vec::new();
        for content in ["a", "b", "c"] {
            let event = WebhookEvent::new(hook.id, content, Headers::new());
            keys.push(store.inner.insert(event).await.unwrap());
        }
        tokio::time::sleep(SETTLE).await;

        assert!(client.requests().await.is_empty());
        assert_eq!(
            store.inner.history(&keys[0]).await,
            [
                WebhookEventStatus::New,
                WebhookEventStatus::Delivering,
                WebhookEventStatus::Failed
            ]
        );
        assert_eq!(handle.parked_count().await.unwrap(), 2);
        assert!(handle.is_running());

        assert_eq!(handle.release_parked(hook.id).await.unwrap(), 2);
        tokio::time::sleep(WAIT + SETTLE).await;

        let requests = client.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content, "bc");
        for key in &keys[1..] {
            assert_eq!(
                store.inner.status(key).await.unwrap(),
                Some(WebhookEventStatus::Delivered)
            );
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let engine = DispatchEngine::new(
            Arc::new(InMemoryWebhookDirectory::new()),
            Arc::new(InMemoryEventStore::new()),
            MockClient::new().into_service(),
            DispatchConfig::default().with_error_channel_capacity(0),
        );

        assert!(matches!(
            engine.start().await,
            Err(Error::InvalidConfig { .. })
        ));
    }
}
