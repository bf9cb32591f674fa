//! Reqwest-based HTTP client for webhook delivery.
//!
//! This module provides a reqwest-based implementation of the [`WebhookClient`] trait.
//!
//! [`WebhookClient`]: crate::WebhookClient
//!
//! # Example
//!
//! ```rust,ignore
//! use hookwire_webhook::reqwest::{ReqwestClient, ReqwestConfig};
//! use hookwire_webhook::WebhookService;
//!
//! // Create a client with a 10 second timeout
//! let client = ReqwestClient::new(ReqwestConfig::new(10))?;
//!
//! // Convert to a service for dependency injection
//! let service: WebhookService = client.into_service();
//! ```

mod client;
mod config;
mod error;

pub use client::ReqwestClient;
pub use config::ReqwestConfig;
pub use error::{Error, Result};

/// Tracing target for reqwest client operations.
pub const TRACING_TARGET: &str = "hookwire_webhook::reqwest";
