//! Events destined for webhooks and their delivery status.

use derive_more::{Display, From};
use hookwire_webhook::Headers;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay};
use uuid::Uuid;

use super::WebhookId;

/// Unique identifier of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Generates a new time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of an event: one event is addressed to exactly one webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, Serialize, Deserialize)]
#[display("{event_id}@{webhook_id}")]
pub struct EventKey {
    pub event_id: EventId,
    pub webhook_id: WebhookId,
}

impl EventKey {
    pub fn new(event_id: EventId, webhook_id: WebhookId) -> Self {
        Self {
            event_id,
            webhook_id,
        }
    }
}

/// Delivery status of an event.
///
/// Statuses only move forward along `New → Delivering → {Delivered, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Serialize, Deserialize, AsRefStr, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WebhookEventStatus {
    /// Created and not yet claimed for dispatch.
    #[default]
    New,
    /// Claimed; its request is being built or is in flight.
    Delivering,
    /// The destination answered `200 OK`.
    Delivered,
    /// The destination answered otherwise, or could not be reached.
    Failed,
}

impl WebhookEventStatus {
    /// Returns whether no further transition is allowed.
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Returns whether `self → next` is an edge of the status lattice.
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Delivering)
                | (Self::Delivering, Self::Delivered)
                | (Self::Delivering, Self::Failed)
        )
    }
}

/// One unit of payload data destined for one webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub key: EventKey,
    #[serde(default)]
    pub status: WebhookEventStatus,
    pub content: String,
    #[serde(default)]
    pub headers: Headers,
}

impl WebhookEvent {
    /// Creates a new event in status [`WebhookEventStatus::New`].
    pub fn new(webhook_id: WebhookId, content: impl Into<String>, headers: Headers) -> Self {
        Self {
            key: EventKey::new(EventId::new(), webhook_id),
            status: WebhookEventStatus::New,
            content: content.into(),
            headers,
        }
    }

    #[inline]
    pub fn webhook_id(&self) -> WebhookId {
        self.key.webhook_id
    }
}
