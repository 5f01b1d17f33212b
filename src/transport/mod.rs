//! Outbound HTTP: the [`Transport`] seam adapters talk through, and its
//! reqwest implementation.

mod http_transport;
mod retry_policy;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EngineError;
use crate::stream::RawEventStream;

pub use http_transport::HttpTransport;
pub use retry_policy::RetryPolicy;

/// One outbound request, fully prepared by an adapter.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: http::Method,
    pub url: url::Url,
    pub headers: http::HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpCall {
    /// A `POST` carrying a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] when the body cannot be
    /// serialized.
    pub fn post_json(
        url: url::Url,
        mut headers: http::HeaderMap,
        body: &serde_json::Value,
    ) -> Result<Self, EngineError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| EngineError::InvalidRequest(format!("request body: {e}")))?;
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Ok(Self {
            method: http::Method::POST,
            url,
            headers,
            body: Some(Bytes::from(bytes)),
        })
    }

    #[must_use]
    pub fn get(url: url::Url, headers: http::HeaderMap) -> Self {
        Self {
            method: http::Method::GET,
            url,
            headers,
            body: None,
        }
    }
}

/// Carries prepared calls to an upstream.
///
/// A non-success status is reported as [`EngineError::Provider`] parsed from
/// the response body; connection failures as [`EngineError::Transport`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the call and demultiplex the SSE response body.
    async fn open_stream(&self, call: HttpCall) -> Result<RawEventStream, EngineError>;

    /// Send the call and return the whole response body.
    async fn send(&self, call: HttpCall) -> Result<String, EngineError>;

    async fn get(&self, call: HttpCall) -> Result<String, EngineError> {
        self.send(call).await
    }
}
