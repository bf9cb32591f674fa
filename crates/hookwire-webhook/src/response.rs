//! Webhook delivery response types.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status code that counts as a successful delivery.
pub const DELIVERED_STATUS: u16 = 200;

/// Response from a webhook delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookHttpResponse {
    /// Request ID this response corresponds to.
    pub request_id: Uuid,
    /// HTTP status code returned by the destination.
    pub status_code: u16,
    /// Timestamp when the request was initiated.
    pub started_at: Timestamp,
    /// Timestamp when the response was received.
    pub finished_at: Timestamp,
}

impl WebhookHttpResponse {
    /// Creates a new webhook response.
    pub fn new(request_id: Uuid, status_code: u16, started_at: Timestamp) -> Self {
        Self {
            request_id,
            status_code,
            started_at,
            finished_at: Timestamp::now(),
        }
    }

    /// Returns whether the destination accepted the delivery.
    ///
    /// Only `200 OK` counts; other 2xx codes are treated as failures.
    pub fn is_delivered(&self) -> bool {
        self.status_code == DELIVERED_STATUS
    }

    /// Calculates the response time as a duration.
    pub fn duration(&self) -> jiff::Span {
        self.started_at.until(self.finished_at).unwrap_or_default()
    }
}
