use std::time::Duration;

use async_trait::async_trait;

use crate::config::HttpConfig;
use crate::error::EngineError;
use crate::protocol::error_shapes::provider_error_from_body;
use crate::stream::{sse_event_stream, RawEventStream};

use super::retry_policy::RetryPolicy;
use super::{HttpCall, Transport};

fn build_reqwest_client(config: &HttpConfig) -> Result<reqwest::Client, EngineError> {
    let pool_idle_timeout = match config.pool_idle_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(config.timeout_secs));
    if !config.use_env_proxy {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|err| EngineError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// reqwest-backed [`Transport`] shared by every adapter of a registry.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// Build a pooled client from the `http` config section.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] when the TLS backend or client
    /// cannot be initialized.
    pub fn new(config: &HttpConfig) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_reqwest_client(config)?,
            retry: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Execute with pre-stream retries and map a final non-success status to
    /// a provider error.
    async fn execute(&self, call: &HttpCall) -> Result<reqwest::Response, EngineError> {
        let mut attempt = 0;
        loop {
            let mut request = reqwest::Request::new(call.method.clone(), call.url.clone());
            *request.headers_mut() = call.headers.clone();
            if let Some(body) = &call.body {
                *request.body_mut() = Some(reqwest::Body::from(body.clone()));
            }

            match self.client.execute(request).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempt < self.retry.max_retries && RetryPolicy::retryable_status(status) {
                        let delay = self.retry.status_delay(response.headers(), attempt);
                        tracing::debug!(
                            status = status.as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying upstream request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(provider_error_from_body(status.as_u16(), &body));
                }
                Err(err) => {
                    if attempt >= self.retry.max_retries || !RetryPolicy::retryable_transport(&err) {
                        return Err(EngineError::Transport(err.to_string()));
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "retrying upstream request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, call: HttpCall) -> Result<RawEventStream, EngineError> {
        let response = self.execute(&call).await?;
        Ok(Box::pin(sse_event_stream(response.bytes_stream())))
    }

    async fn send(&self, call: HttpCall) -> Result<String, EngineError> {
        let response = self.execute(&call).await?;
        response
            .text()
            .await
            .map_err(|err| EngineError::Transport(format!("response body error: {err}")))
    }
}
