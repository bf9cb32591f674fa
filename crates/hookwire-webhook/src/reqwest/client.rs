//! Reqwest-based HTTP client for webhook delivery.

use std::sync::Arc;

use jiff::Timestamp;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{Error, ReqwestConfig, TRACING_TARGET};
use crate::{Headers, WebhookClient, WebhookHttpRequest, WebhookHttpResponse, WebhookService};

/// Inner client that holds the HTTP client and configuration.
struct ReqwestClientInner {
    http: Client,
    config: ReqwestConfig,
}

/// Reqwest-based HTTP client that POSTs webhook requests to their destination.
///
/// The request body is sent as-is and the request headers are forwarded in
/// order, duplicates included. Any HTTP status is returned as a response;
/// only transport problems become errors.
#[derive(Clone)]
pub struct ReqwestClient {
    inner: Arc<ReqwestClientInner>,
}

impl std::fmt::Debug for ReqwestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestClient")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ReqwestClient {
    /// Creates a new reqwest client with the given configuration.
    pub fn new(config: ReqwestConfig) -> crate::Result<Self> {
        let timeout = config.timeout();
        let connect_timeout = config.connect_timeout();

        tracing::debug!(
            target: TRACING_TARGET,
            timeout_ms = timeout.as_millis(),
            connect_timeout_ms = connect_timeout.as_millis(),
            "Creating reqwest client"
        );

        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .user_agent(config.effective_user_agent())
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            inner: Arc::new(ReqwestClientInner { http, config }),
        })
    }

    /// Gets the client configuration.
    pub fn config(&self) -> &ReqwestConfig {
        &self.inner.config
    }

    /// Converts this client into a [`WebhookService`] for use with dependency injection.
    pub fn into_service(self) -> WebhookService {
        WebhookService::new(self)
    }

    /// Converts ordered header pairs into a reqwest header map.
    fn header_map(headers: &Headers) -> Result<HeaderMap, Error> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            let invalid = || Error::InvalidHeader {
                name: name.to_owned(),
            };
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            map.append(name, value);
        }
        Ok(map)
    }
}

#[async_trait::async_trait]
impl WebhookClient for ReqwestClient {
    async fn send(&self, request: &WebhookHttpRequest) -> crate::Result<WebhookHttpResponse> {
        let started_at = Timestamp::now();

        tracing::debug!(
            target: TRACING_TARGET,
            request_id = %request.request_id,
            url = %request.url,
            content_length = request.content.len(),
            "Sending webhook request"
        );

        let headers = Self::header_map(&request.headers)?;
        let timeout = request.timeout.unwrap_or_else(|| self.config().timeout());

        let http_response = self
            .inner
            .http
            .post(request.url.clone())
            .headers(headers)
            .timeout(timeout)
            .body(request.content.clone())
            .send()
            .await
            .map_err(Error::from)?;

        let status_code = http_response.status().as_u16();
        let response = WebhookHttpResponse::new(request.request_id, status_code, started_at);

        tracing::debug!(
            target: TRACING_TARGET,
            request_id = %request.request_id,
            status_code,
            delivered = response.is_delivered(),
            "Webhook request completed"
        );

        Ok(response)
    }
}
