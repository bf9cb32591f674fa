//! Outbound webhook request type.

use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::Headers;

/// The wire payload sent to a webhook destination.
///
/// For a batch, `content` is the merged payload and `headers` are the
/// representative headers of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookHttpRequest {
    /// Unique identifier for this request.
    pub request_id: Uuid,
    /// The webhook endpoint URL.
    pub url: Url,
    /// Request body.
    pub content: String,
    /// Headers sent with the request, in order.
    pub headers: Headers,
    /// Optional request timeout (uses client default if not set).
    pub timeout: Option<Duration>,
}

impl WebhookHttpRequest {
    /// Creates a new webhook request.
    pub fn new(url: Url, content: impl Into<String>, headers: Headers) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            url,
            content: content.into(),
            headers,
            timeout: None,
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Appends a header to the request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }
}
