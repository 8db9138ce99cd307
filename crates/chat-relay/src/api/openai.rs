//! reqwest-based transport for OpenAI and Azure OpenAI chat completions.

use std::time::Instant;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::retry::RetryConfig;
use super::streaming::chunk_stream;
use super::upstream::{Completion, ChunkStream, Upstream, UpstreamFuture};
use crate::config::{ConfigError, RelayConfig};
use crate::{ApiType, ChatRequest, UpstreamError};

/// Async HTTP client for an OpenAI-compatible chat completions endpoint.
///
/// The overall request timeout is fixed when the client is built.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    api_version: Option<String>,
    retry: RetryConfig,
}

impl OpenAiClient {
    /// Build a client from relay configuration.
    pub fn new(config: &RelayConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("chat-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            api_version: config.api_version.clone(),
            retry: config.retry.clone(),
        })
    }

    /// Full URL for a chat-completion call on the given model.
    ///
    /// Azure routes by deployment (the model name) and requires the
    /// `api-version` query parameter.
    pub fn endpoint_url(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        match &self.api_version {
            Some(version) => format!(
                "{base}/openai/deployments/{model}/chat/completions?api-version={version}"
            ),
            None => format!("{base}/chat/completions"),
        }
    }

    /// POST the request, retrying transient failures per the retry policy.
    async fn post(&self, body: &ChatRequest) -> Result<reqwest::Response, UpstreamError> {
        let mut attempt = 0;
        loop {
            match self.post_once(body).await {
                Err(err) if self.retry.should_retry(attempt, &err) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        "Upstream attempt {} failed ({err}), retrying in {:.1}s",
                        attempt + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn post_once(&self, body: &ChatRequest) -> Result<reqwest::Response, UpstreamError> {
        let url = self.endpoint_url(body.model());
        debug!(
            "Upstream request: url={}, model={}, stream={}",
            url,
            body.model(),
            body.is_stream()
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let request = self.client.post(&url).json(body);
        let request = match self.api_type() {
            ApiType::Azure => request.header("api-key", &self.api_key),
            ApiType::OpenAi => request.bearer_auth(&self.api_key),
        };

        let start = Instant::now();
        let resp = request.send().await.map_err(map_transport_error)?;
        let status = resp.status();
        debug!(
            "Upstream response: HTTP {} in {:.1}s",
            status,
            start.elapsed().as_secs_f64()
        );

        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(map_status(status, &text))
    }
}

impl Upstream for OpenAiClient {
    fn send(&self, mut request: ChatRequest) -> UpstreamFuture<'_, Completion> {
        Box::pin(async move {
            request.0.remove("stream");
            request.0.remove("stream_options");

            let resp = self.post(&request).await?;
            let text = resp
                .text()
                .await
                .map_err(|e| UpstreamError::Api {
                    status: None,
                    message: format!("failed to read response: {e}"),
                })?;
            let completion: Value = serde_json::from_str(&text)
                .map_err(|e| UpstreamError::Other(format!("failed to parse response: {e}")))?;

            if let Some(err) = completion.get("error").filter(|e| !e.is_null()) {
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                return Err(UpstreamError::Api {
                    status: None,
                    message: format!("API error: {message}"),
                });
            }
            Ok(completion)
        })
    }

    fn send_streaming(&self, mut request: ChatRequest) -> UpstreamFuture<'_, ChunkStream> {
        Box::pin(async move {
            request.enable_streaming();
            let resp = self.post(&request).await?;
            Ok(chunk_stream(resp))
        })
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_type(&self) -> ApiType {
        if self.api_version.is_some() {
            ApiType::Azure
        } else {
            ApiType::OpenAi
        }
    }
}

/// Map a non-success HTTP status and body to an upstream failure.
pub fn map_status(status: StatusCode, body: &str) -> UpstreamError {
    let message = format!("HTTP {status}: {body}");
    match status.as_u16() {
        400 => UpstreamError::BadRequest(message),
        401 => UpstreamError::Authentication(message),
        429 => UpstreamError::RateLimit(message),
        code => UpstreamError::Api {
            status: Some(code),
            message,
        },
    }
}

fn map_transport_error(e: reqwest::Error) -> UpstreamError {
    let message = if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        format!("request failed: {e}")
    };
    UpstreamError::Api {
        status: None,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(config: RelayConfig) -> OpenAiClient {
        OpenAiClient::new(&config).unwrap()
    }

    #[test]
    fn openai_endpoint() {
        let c = client(RelayConfig::new("k").with_base_url("https://api.openai.com/v1/"));
        assert_eq!(
            c.endpoint_url("gpt-4o"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(c.api_type(), ApiType::OpenAi);
    }

    #[test]
    fn azure_endpoint_routes_by_deployment() {
        let c = client(
            RelayConfig::new("k")
                .with_base_url("https://res.openai.azure.com")
                .with_api_version("2024-06-01"),
        );
        assert_eq!(
            c.endpoint_url("gpt-4o"),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
        assert_eq!(c.api_type(), ApiType::Azure);
        assert_eq!(c.base_url(), "https://res.openai.azure.com");
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "invalid_api_key"),
            UpstreamError::Authentication(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded"),
            UpstreamError::RateLimit(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "bad"),
            UpstreamError::BadRequest(_)
        ));
        match map_status(StatusCode::NOT_FOUND, "The model `x` does not exist") {
            UpstreamError::Api { status, message } => {
                assert_eq!(status, Some(404));
                assert!(message.starts_with("HTTP 404 Not Found:"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
