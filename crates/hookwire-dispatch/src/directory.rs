//! Webhook directory: the read side of webhook registration.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::Result;
use crate::types::{Webhook, WebhookId, WebhookStatus};

/// Resolves webhook identifiers to their registration.
///
/// The engine only ever reads from the directory.
#[async_trait::async_trait]
pub trait WebhookDirectory: Send + Sync {
    /// Looks up a webhook, returning `Ok(None)` when it is not registered.
    async fn lookup(&self, webhook_id: &WebhookId) -> Result<Option<Webhook>>;
}

/// In-memory webhook directory.
#[derive(Debug, Default)]
pub struct InMemoryWebhookDirectory {
    webhooks: RwLock<HashMap<WebhookId, Webhook>>,
}

impl InMemoryWebhookDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory pre-populated with `webhooks`.
    pub fn from_webhooks(webhooks: impl IntoIterator<Item = Webhook>) -> Self {
        let webhooks = webhooks.into_iter().map(|w| (w.id, w)).collect();
        Self {
            webhooks: RwLock::new(webhooks),
        }
    }

    /// Registers or replaces a webhook.
    pub async fn insert(&self, webhook: Webhook) {
        self.webhooks.write().await.insert(webhook.id, webhook);
    }

    /// Removes a webhook, returning it if it was registered.
    pub async fn remove(&self, webhook_id: &WebhookId) -> Option<Webhook> {
        self.webhooks.write().await.remove(webhook_id)
    }

    /// Changes the status of a registered webhook.
    ///
    /// Returns `false` when the webhook is not registered.
    pub async fn set_status(&self, webhook_id: &WebhookId, status: WebhookStatus) -> bool {
        match self.webhooks.write().await.get_mut(webhook_id) {
            Some(webhook) => {
                webhook.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.webhooks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.webhooks.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl WebhookDirectory for InMemoryWebhookDirectory {
    async fn lookup(&self, webhook_id: &WebhookId) -> Result<Option<Webhook>> {
        Ok(self.webhooks.read().await.get(webhook_id).cloned())
    }
}
