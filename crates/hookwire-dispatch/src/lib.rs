#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod directory;
mod dispatch;
mod engine;
mod error;
mod stats;
mod store;

pub mod batch;
pub mod types;

pub use config::{
    BatchingConfig, DEFAULT_ERROR_CHANNEL_CAPACITY, DEFAULT_IDLE_TTL, DEFAULT_MAX_PARKED,
    DEFAULT_SHUTDOWN_TIMEOUT, DispatchArgs, DispatchConfig,
};
pub use directory::{InMemoryWebhookDirectory, WebhookDirectory};
pub use engine::{DispatchEngine, DispatchHandle};
pub use error::{Error, Result, WebhookError};
pub use stats::DispatchStatsSnapshot;
pub use store::{EventStore, EventStream, InMemoryEventStore};
pub use types::{
    DeliveryMode, EventId, EventKey, Webhook, WebhookEvent, WebhookEventStatus, WebhookId,
    WebhookStatus,
};
