//! HTTP dispatch and status write-back for singles and flushed batches.

use std::slice;
use std::sync::Arc;

use futures::future::join_all;
use hookwire_webhook::{WebhookHttpRequest, WebhookService};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::batch::Batch;
use crate::stats::DispatchStats;
use crate::store::EventStore;
use crate::types::{EventKey, Webhook, WebhookEvent, WebhookEventStatus};
use crate::{Error, Result};

/// Tracing target for dispatch operations.
const TRACING_TARGET: &str = "hookwire_dispatch::dispatch";

/// What one HTTP request is sent for.
#[derive(Debug, Clone)]
pub(crate) enum DispatchUnit {
    Single { webhook: Webhook, event: WebhookEvent },
    Batch(Batch),
}

impl DispatchUnit {
    pub fn webhook(&self) -> &Webhook {
        match self {
            Self::Single { webhook, .. } => webhook,
            Self::Batch(batch) => batch.webhook(),
        }
    }

    /// Members in the order they are claimed.
    pub fn events(&self) -> &[WebhookEvent] {
        match self {
            Self::Single { event, .. } => slice::from_ref(event),
            Self::Batch(batch) => batch.events(),
        }
    }

    fn to_request(&self) -> Result<WebhookHttpRequest> {
        match self {
            Self::Single { webhook, event } => Ok(WebhookHttpRequest::new(
                webhook.url.clone(),
                event.content.clone(),
                event.headers.clone(),
            )),
            Self::Batch(batch) => batch.to_request(),
        }
    }
}

/// First fatal error of the engine, and the token it cancels.
#[derive(Debug, Clone)]
pub(crate) struct FatalSignal {
    error: Arc<Mutex<Option<Error>>>,
    cancel: CancellationToken,
}

impl FatalSignal {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            error: Arc::default(),
            cancel,
        }
    }

    /// Records `error` unless an earlier one is recorded, then stops the engine.
    pub async fn trigger(&self, error: Error) {
        tracing::error!(
            target: TRACING_TARGET,
            error = %error,
            "Internal invariant violated, stopping dispatch engine"
        );

        let mut slot = self.error.lock().await;
        if slot.is_none() {
            *slot = Some(error);
        }
        self.cancel.cancel();
    }

    /// Takes the recorded error, if any.
    pub async fn take(&self) -> Option<Error> {
        self.error.lock().await.take()
    }
}

/// Claims events, sends their request and writes the outcome back.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    store: Arc<dyn EventStore>,
    client: WebhookService,
    stats: Arc<DispatchStats>,
    tracker: TaskTracker,
    fatal: FatalSignal,
    /// Members of abandoned units that are still `New`.
    unclaimed: mpsc::UnboundedSender<WebhookEvent>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        client: WebhookService,
        stats: Arc<DispatchStats>,
        tracker: TaskTracker,
        fatal: FatalSignal,
        unclaimed: mpsc::UnboundedSender<WebhookEvent>,
    ) -> Self {
        Self {
            store,
            client,
            stats,
            tracker,
            fatal,
            unclaimed,
        }
    }

    /// Claims every member of `unit` and sends it on a tracked task.
    ///
    /// The claim completes before this returns, so callers that dispatch in
    /// order also claim in order. Nothing is sent if any claim fails.
    pub async fn dispatch(&self, unit: DispatchUnit) {
        if !self.claim(unit.events()).await {
            return;
        }

        let this = self.clone();
        self.tracker.spawn(async move { this.complete(unit).await });
    }

    /// Moves every member `New → Delivering`, in order.
    ///
    /// When one claim fails the whole unit is abandoned: members claimed so
    /// far are failed, and members still `New` are handed back to the engine.
    /// A member another path already claimed is never handed back.
    async fn claim(&self, events: &[WebhookEvent]) -> bool {
        for (index, event) in events.iter().enumerate() {
            let result = self
                .store
                .set_status(&event.key, WebhookEventStatus::Delivering)
                .await;

            let Err(err) = result else {
                continue;
            };

            let unclaimed = if err.is_invariant_violation() {
                &events[index + 1..]
            } else {
                &events[index..]
            };
            self.handle_store_error(err, &event.key).await;
            self.abandon(&events[..index], unclaimed).await;
            return false;
        }
        true
    }

    async fn abandon(&self, claimed: &[WebhookEvent], unclaimed: &[WebhookEvent]) {
        tracing::warn!(
            target: TRACING_TARGET,
            claimed = claimed.len(),
            unclaimed = unclaimed.len(),
            "Claim failed, abandoning dispatch unit"
        );

        if !claimed.is_empty() {
            self.write_back(claimed, WebhookEventStatus::Failed).await;
            self.stats.record_outcome(false, claimed.len());
        }

        for event in unclaimed {
            if self.unclaimed.send(event.clone()).is_err() {
                tracing::warn!(
                    target: TRACING_TARGET,
                    event = %event.key,
                    "Engine stopped, unclaimed event left new"
                );
            }
        }
    }

    /// Sends the unit's request and applies its outcome to every member.
    async fn complete(&self, unit: DispatchUnit) {
        let webhook = unit.webhook();
        let events = unit.events();
        if matches!(unit, DispatchUnit::Batch(_)) {
            self.stats.record_batch();
        }

        let delivered = match unit.to_request() {
            Ok(request) => self.send(webhook, &request, events.len()).await,
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    webhook_id = %webhook.id,
                    events = events.len(),
                    error = %err,
                    "Failed to build request, failing all members"
                );
                false
            }
        };

        let status = if delivered {
            WebhookEventStatus::Delivered
        } else {
            WebhookEventStatus::Failed
        };
        self.write_back(events, status).await;
        self.stats.record_outcome(delivered, events.len());
    }

    async fn send(
        &self,
        webhook: &Webhook,
        request: &WebhookHttpRequest,
        members: usize,
    ) -> bool {
        tracing::debug!(
            target: TRACING_TARGET,
            request_id = %request.request_id,
            webhook_id = %webhook.id,
            url = %request.url,
            events = members,
            "Sending webhook request"
        );

        self.stats.record_request();
        match self.client.send(request).await {
            Ok(response) => {
                let delivered = response.is_delivered();
                tracing::debug!(
                    target: TRACING_TARGET,
                    request_id = %request.request_id,
                    webhook_id = %webhook.id,
                    status_code = response.status_code,
                    delivered,
                    "Webhook request completed"
                );
                delivered
            }
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    request_id = %request.request_id,
                    webhook_id = %webhook.id,
                    error = %err,
                    retryable = err.is_retryable(),
                    "Webhook request failed"
                );
                false
            }
        }
    }

    async fn write_back(&self, events: &[WebhookEvent], status: WebhookEventStatus) {
        let writes = events
            .iter()
            .map(|event| self.store.set_status(&event.key, status));

        for (event, result) in events.iter().zip(join_all(writes).await) {
            if let Err(err) = result {
                self.handle_store_error(err, &event.key).await;
            }
        }
    }

    async fn handle_store_error(&self, err: Error, key: &EventKey) {
        if err.is_invariant_violation() {
            self.fatal.trigger(err).await;
            return;
        }

        tracing::error!(
            target: TRACING_TARGET,
            event = %key,
            error = %err,
            "Failed to update event status"
        );
    }
}
