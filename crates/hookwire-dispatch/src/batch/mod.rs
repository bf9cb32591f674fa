//! Windowed batching of events per webhook and content category.
//!
//! Every active [`BatchKey`] is owned by one batcher task that keeps the open
//! batch to itself. The [`BatchAggregator`] only holds the sending side of each
//! key's queue: it spawns a task when a key becomes active and retires it once
//! the key has been idle for a while.
//!
//! ```text
//!                 ┌──────────────────┐   (webhook, json)   ┌───────────────┐
//!  event ───────▶ │ BatchAggregator  │ ──────────────────▶ │ batcher task  │──▶ flush
//!                 │ (supervisor)     │   (webhook, text)   ├───────────────┤
//!                 └──────────────────┘ ──────────────────▶ │ batcher task  │──▶ flush
//!                                                          └───────────────┘
//! ```

mod aggregator;
mod category;
mod merge;

use std::fmt;

use hookwire_webhook::{Headers, WebhookHttpRequest};
use tokio::time::Instant;

pub(crate) use aggregator::BatchAggregator;
pub use category::ContentCategory;
pub use merge::merge_contents;

use crate::types::{Webhook, WebhookEvent, WebhookId};
use crate::{Error, Result};

/// Key under which events are grouped into one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub webhook_id: WebhookId,
    pub category: ContentCategory,
}

impl BatchKey {
    /// Returns the key an event belongs to.
    pub fn of(event: &WebhookEvent) -> Self {
        Self {
            webhook_id: event.webhook_id(),
            category: ContentCategory::of(&event.headers),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.webhook_id, self.category)
    }
}

/// Events of one key collected for a single request, in arrival order.
///
/// Never empty: a batch is opened by its first event.
#[derive(Debug, Clone)]
pub struct Batch {
    key: BatchKey,
    webhook: Webhook,
    events: Vec<WebhookEvent>,
    opened_at: Instant,
}

impl Batch {
    /// Opens a batch with its first member.
    pub fn open(webhook: Webhook, first: WebhookEvent) -> Self {
        Self {
            key: BatchKey::of(&first),
            webhook,
            events: vec![first],
            opened_at: Instant::now(),
        }
    }

    /// Appends a member.
    pub fn push(&mut self, event: WebhookEvent) {
        debug_assert_eq!(BatchKey::of(&event), self.key);
        self.events.push(event);
    }

    #[inline]
    pub fn key(&self) -> BatchKey {
        self.key
    }

    /// Webhook as resolved when the batch was opened.
    #[inline]
    pub fn webhook(&self) -> &Webhook {
        &self.webhook
    }

    #[inline]
    pub fn events(&self) -> &[WebhookEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Instant the first member arrived.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Builds the single request for this batch.
    ///
    /// The merged body follows the key's [`ContentCategory`]; the headers are
    /// those of the first member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Merge`] when a JSON member does not parse.
    pub fn to_request(&self) -> Result<WebhookHttpRequest> {
        let content = merge_contents(
            self.key.category,
            self.events.iter().map(|e| e.content.as_str()),
        )
        .map_err(|reason| Error::merge(self.key.webhook_id, reason))?;

        let headers = self
            .events
            .first()
            .map(|e| e.headers.clone())
            .unwrap_or_else(Headers::new);

        Ok(WebhookHttpRequest::new(
            self.webhook.url.clone(),
            content,
            headers,
        ))
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    fn webhook() -> Webhook {
        Webhook::new(
            WebhookId::new(),
            Url::parse("https://example.com/hook").unwrap(),
            "batch",
        )
    }

    fn json_event(webhook: &Webhook, content: &str) -> WebhookEvent {
        let headers = Headers::new()
            .with("Content-Type", "application/json")
            .with("X-Source", content);
        WebhookEvent::new(webhook.id, content, headers)
    }

    #[test]
    fn test_key_separates_categories() {
        let webhook = webhook();
        let json = json_event(&webhook, "{}");
        let text = WebhookEvent::new(webhook.id, "x", Headers::new());

        assert_ne!(BatchKey::of(&json), BatchKey::of(&text));
        assert_eq!(BatchKey::of(&json).category, ContentCategory::Json);
    }

    #[test]
    fn test_request_merges_in_arrival_order() {
        let webhook = webhook();
        let first = json_event(&webhook, r#"{"event":"payload0"}"#);
        let mut batch = Batch::open(webhook.clone(), first);
        batch.push(json_event(&webhook, r#"{"event":"payload1"}"#));

        let request = batch.to_request().unwrap();
        assert_eq!(request.url, webhook.url);
        assert_eq!(
            request.content,
            r#"[{"event":"payload0"},{"event":"payload1"}]"#
        );
        assert_eq!(request.headers.get("X-Source"), Some(r#"{"event":"payload0"}"#));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_request_fails_on_invalid_json_member() {
        let webhook = webhook();
        let mut batch = Batch::open(webhook.clone(), json_event(&webhook, "{}"));
        batch.push(json_event(&webhook, "{"));

        assert!(matches!(batch.to_request(), Err(Error::Merge { .. })));
    }
}
