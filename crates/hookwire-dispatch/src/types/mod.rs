//! Data model shared by the engine and its collaborators.

mod event;
mod webhook;

pub use event::{EventId, EventKey, WebhookEvent, WebhookEventStatus};
pub use webhook::{DeliveryMode, Webhook, WebhookId, WebhookStatus};
