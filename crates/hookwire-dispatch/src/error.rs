//! Error types for the dispatch engine.

use serde::{Deserialize, Serialize};

use crate::types::{EventKey, WebhookEventStatus, WebhookId};

/// Result type for all dispatch operations in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type for dispatch operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A status write violated the `New → Delivering → {Delivered, Failed}` lattice.
    ///
    /// Seeing this at runtime means two dispatch paths claimed the same event.
    #[error("Invalid status transition for event {key}: {from} -> {to}")]
    InvalidTransition {
        key: EventKey,
        from: WebhookEventStatus,
        to: WebhookEventStatus,
    },

    /// Status write for an event the store does not know.
    #[error("Event {key} not found")]
    EventNotFound { key: EventKey },

    /// Invalid configuration
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Batch members could not be merged into one payload.
    #[error("Failed to merge batch for webhook {webhook_id}: {reason}")]
    Merge { webhook_id: WebhookId, reason: String },

    /// Event store operation failed.
    #[error("Event store operation '{operation}' failed: {details}")]
    Store { operation: String, details: String },

    /// The engine is no longer running.
    #[error("Dispatch engine is shut down")]
    Shutdown,
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a merge error
    pub fn merge(webhook_id: WebhookId, reason: impl Into<String>) -> Self {
        Self::Merge {
            webhook_id,
            reason: reason.into(),
        }
    }

    /// Create an event store error
    pub fn store(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// Returns whether this error means the engine's own bookkeeping is broken.
    ///
    /// Such errors stop the engine instead of being recovered per event.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::EventNotFound { .. }
        )
    }
}

/// Operational error reported on the engine's error channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookError {
    /// An event referenced a webhook the directory does not know.
    #[error("Webhook {webhook_id} not found")]
    MissingWebhook { webhook_id: WebhookId },
}
