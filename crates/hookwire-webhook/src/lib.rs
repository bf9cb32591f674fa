#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
mod headers;
mod service;

pub mod request;
pub mod response;

#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
pub mod reqwest;

#[cfg(feature = "test-utils")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-utils")))]
pub mod mock;

pub use error::{BoxedError, Error, ErrorKind, Result};
pub use headers::{CONTENT_TYPE, Headers};
pub use request::WebhookHttpRequest;
pub use response::WebhookHttpResponse;
pub use service::WebhookService;

/// Tracing target for webhook operations.
pub const TRACING_TARGET: &str = "hookwire_webhook";

/// Core trait for sending webhook requests.
///
/// One call sends exactly one HTTP request. Implementations report transport
/// failures as `Err`; any HTTP status, successful or not, is an `Ok` response.
#[async_trait::async_trait]
pub trait WebhookClient: Send + Sync {
    /// Sends a request to its destination and returns the response.
    async fn send(&self, request: &WebhookHttpRequest) -> Result<WebhookHttpResponse>;
}
