//! Loading webhooks and feeding events into the store.

use std::path::Path;

use anyhow::Context;
use hookwire_dispatch::{EventId, EventKey, InMemoryEventStore, Webhook, WebhookEvent, WebhookId};
use hookwire_webhook::{CONTENT_TYPE, Headers};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::TRACING_TARGET_INPUT;

/// Content type assigned to structured content without a declared type.
const JSON_CONTENT_TYPE: &str = "application/json";

/// Reads the JSON array of webhooks at `path`.
pub async fn load_webhooks(path: &Path) -> anyhow::Result<Vec<Webhook>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read webhooks file '{}'", path.display()))?;
    let webhooks: Vec<Webhook> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse webhooks file '{}'", path.display()))?;

    tracing::info!(
        target: TRACING_TARGET_INPUT,
        path = %path.display(),
        count = webhooks.len(),
        "Loaded webhooks"
    );
    Ok(webhooks)
}

/// One line of the events input.
#[derive(Debug, Deserialize)]
struct EventRecord {
    #[serde(default)]
    event_id: Option<EventId>,
    webhook_id: WebhookId,
    content: serde_json::Value,
    #[serde(default)]
    headers: Headers,
}

impl EventRecord {
    fn into_event(self) -> WebhookEvent {
        let mut headers = self.headers;
        let content = match self.content {
            serde_json::Value::String(text) => text,
            value => {
                if headers.content_type().is_none() {
                    headers.push(CONTENT_TYPE, JSON_CONTENT_TYPE);
                }
                value.to_string()
            }
        };

        let mut event = WebhookEvent::new(self.webhook_id, content, headers);
        if let Some(event_id) = self.event_id {
            event.key = EventKey::new(event_id, self.webhook_id);
        }
        event
    }
}

/// Counts of processed input lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub accepted: usize,
    pub rejected: usize,
}

/// Feeds the events file at `path`, or stdin for `-`, into `store`.
pub async fn feed_events(
    path: &Path,
    stdin: bool,
    store: &InMemoryEventStore,
) -> anyhow::Result<FeedSummary> {
    if stdin {
        let reader = BufReader::new(tokio::io::stdin());
        return feed_lines(reader, store).await;
    }

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open events file '{}'", path.display()))?;
    feed_lines(BufReader::new(file), store).await
}

/// Stores one event per non-empty line; malformed lines are logged and skipped.
pub async fn feed_lines<R>(reader: R, store: &InMemoryEventStore) -> anyhow::Result<FeedSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = FeedSummary::default();
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read events")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = match serde_json::from_str::<EventRecord>(line) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET_INPUT,
                    line = line_number,
                    error = %err,
                    "Skipping malformed event"
                );
                summary.rejected += 1;
                continue;
            }
        };

        match store.insert(record.into_event()).await {
            Ok(key) => {
                tracing::trace!(target: TRACING_TARGET_INPUT, event = %key, "Event stored");
                summary.accepted += 1;
            }
            Err(err) => {
                tracing::warn!(
                    target: TRACING_TARGET_INPUT,
                    line = line_number,
                    error = %err,
                    "Skipping rejected event"
                );
                summary.rejected += 1;
            }
        }
    }

    Ok(summary)
}
