//! Recording mock client for tests.
//!
//! This module is only available when the `test-utils` feature is enabled:
//!
//! ```toml
//! [dev-dependencies]
//! hookwire-webhook = { version = "...", features = ["test-utils"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use hookwire_webhook::mock::MockClient;
//!
//! let client = MockClient::new().with_status_for(url, 500);
//! let service = client.clone().into_service();
//! // ... drive deliveries ...
//! assert_eq!(client.requests().await.len(), 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio::sync::{Mutex, Notify};
use url::Url;

use crate::{
    Error, Result, WebhookClient, WebhookHttpRequest, WebhookHttpResponse, WebhookService,
};

/// Scripted outcome for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Answer with this HTTP status code.
    Status(u16),
    /// Fail as if the connection could not be established.
    TransportError,
}

#[derive(Debug, Default)]
struct MockState {
    requests: Mutex<Vec<WebhookHttpRequest>>,
    notify: Notify,
}

/// Client that records every request and answers with scripted outcomes.
///
/// Unless configured otherwise every destination answers `200 OK`.
#[derive(Debug, Clone)]
pub struct MockClient {
    state: Arc<MockState>,
    default: MockOutcome,
    overrides: HashMap<Url, MockOutcome>,
    latency: Option<Duration>,
}

impl Default for MockClient {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            default: MockOutcome::Status(200),
            overrides: HashMap::new(),
            latency: None,
        }
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status returned for destinations without an override.
    #[must_use]
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.default = MockOutcome::Status(status_code);
        self
    }

    /// Makes every destination without an override fail at the transport level.
    #[must_use]
    pub fn with_transport_error(mut self) -> Self {
        self.default = MockOutcome::TransportError;
        self
    }

    /// Sets the status returned for one destination.
    #[must_use]
    pub fn with_status_for(mut self, url: Url, status_code: u16) -> Self {
        self.overrides.insert(url, MockOutcome::Status(status_code));
        self
    }

    /// Makes one destination fail at the transport level.
    #[must_use]
    pub fn with_transport_error_for(mut self, url: Url) -> Self {
        self.overrides.insert(url, MockOutcome::TransportError);
        self
    }

    /// Delays every answer by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Wraps a clone of this client into a [`WebhookService`].
    pub fn into_service(self) -> WebhookService {
        WebhookService::new(self)
    }

    /// Returns every request received so far, in arrival order.
    pub async fn requests(&self) -> Vec<WebhookHttpRequest> {
        self.state.requests.lock().await.clone()
    }

    /// Returns the requests sent to `url`, in arrival order.
    pub async fn requests_to(&self, url: &Url) -> Vec<WebhookHttpRequest> {
        self.state
            .requests
            .lock()
            .await
            .iter()
            .filter(|r| &r.url == url)
            .cloned()
            .collect()
    }

    /// Waits until at least `count` requests were received or `timeout` passed.
    ///
    /// Returns the number of requests received.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> usize {
        let wait = async {
            loop {
                let notified = self.state.notify.notified();
                let received = self.state.requests.lock().await.len();
                if received >= count {
                    return received;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(received) => received,
            Err(_) => self.state.requests.lock().await.len(),
        }
    }

    fn outcome_for(&self, url: &Url) -> MockOutcome {
        self.overrides.get(url).copied().unwrap_or(self.default)
    }
}

#[async_trait::async_trait]
impl WebhookClient for MockClient {
    async fn send(&self, request: &WebhookHttpRequest) -> Result<WebhookHttpResponse> {
        let started_at = Timestamp::now();
        self.state.requests.lock().await.push(request.clone());
        self.state.notify.notify_waiters();

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.outcome_for(&request.url) {
            MockOutcome::Status(status_code) => Ok(WebhookHttpResponse::new(
                request.request_id,
                status_code,
                started_at,
            )),
            MockOutcome::TransportError => Err(Error::network_error()
                .with_message("Connection refused")
                .with_context(request.url.to_string())),
        }
    }
}
