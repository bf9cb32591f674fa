//! Cloneable handle around a [`WebhookClient`].

use std::fmt;
use std::sync::Arc;

use crate::{Result, WebhookClient, WebhookHttpRequest, WebhookHttpResponse};

/// Shared webhook client used for dependency injection.
///
/// Cloning is cheap; every clone talks to the same underlying client.
#[derive(Clone)]
pub struct WebhookService {
    inner: Arc<dyn WebhookClient>,
}

impl WebhookService {
    /// Wraps a client implementation.
    pub fn new(client: impl WebhookClient + 'static) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    /// Wraps an already shared client.
    pub fn from_arc(client: Arc<dyn WebhookClient>) -> Self {
        Self { inner: client }
    }

    /// Sends one request through the wrapped client.
    pub async fn send(&self, request: &WebhookHttpRequest) -> Result<WebhookHttpResponse> {
        self.inner.send(request).await
    }
}

impl fmt::Debug for WebhookService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookService").finish_non_exhaustive()
    }
}
