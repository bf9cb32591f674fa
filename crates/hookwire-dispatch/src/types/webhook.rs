//! Registered webhook destinations.

use derive_more::{Display, From};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay};
use url::Url;
use uuid::Uuid;

/// Unique identifier of a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(pub Uuid);

impl WebhookId {
    /// Generates a new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

/// Availability of a webhook, as maintained by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Events are delivered.
    Enabled,
    /// Turned off by its owner.
    Disabled,
    /// Considered unreachable since the given instant.
    Unavailable { since: Timestamp },
}

impl WebhookStatus {
    /// Returns whether events for this webhook may be dispatched.
    #[inline]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// How events for a webhook are grouped into requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Serialize, Deserialize, AsRefStr, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryMode {
    /// One request per event, attempted once.
    #[default]
    SingleAtMostOnce,
    /// Events are merged into windowed batches, each attempted once.
    BatchedAtMostOnce,
}

/// A registered HTTP destination with its delivery policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub url: Url,
    pub label: String,
    pub status: WebhookStatus,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
}

impl Webhook {
    /// Creates an enabled single-delivery webhook.
    pub fn new(id: WebhookId, url: Url, label: impl Into<String>) -> Self {
        Self {
            id,
            url,
            label: label.into(),
            status: WebhookStatus::Enabled,
            delivery_mode: DeliveryMode::SingleAtMostOnce,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: WebhookStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }
}
