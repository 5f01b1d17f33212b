use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue};

use crate::adapter::{build_wire_body, decode_response, Adapter, TurnRequest};
use crate::config::ProviderConfig;
use crate::error::{EngineError, ErrorCategory};
use crate::observability::log_turn_complete;
use crate::protocol::canonical::{ModelInfo, ProviderKind, StreamEvent};
use crate::protocol::parse_model_list;
use crate::stream::{decode_event_stream, decoder_for, EventStream};
use crate::transport::{HttpCall, Transport};
use crate::util::join_endpoint;

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// An [`Adapter`] that speaks one provider's HTTP API.
pub struct HttpAdapter {
    name: String,
    kind: ProviderKind,
    base_url: String,
    api_key: String,
    api_version: Option<String>,
    default_max_tokens: u64,
    models: Vec<String>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for HttpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdapter")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl HttpAdapter {
    /// The base URL is only checked when a call is made.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: ProviderKind,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_version: None,
            default_max_tokens: DEFAULT_MAX_TOKENS,
            models: Vec::new(),
            transport,
        }
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an unknown provider name.
    pub fn from_config(
        config: &ProviderConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EngineError> {
        let kind = config.kind().ok_or_else(|| {
            EngineError::Config(format!(
                "provider '{}' has unknown kind '{}'",
                config.name, config.provider
            ))
        })?;
        let mut adapter = Self::new(
            config.name.clone(),
            kind,
            config.base_url.clone(),
            config.api_key.clone(),
            transport,
        )
        .with_default_max_tokens(config.default_max_tokens)
        .with_models(config.models.clone());
        adapter.api_version = config.api_version.clone();
        Ok(adapter)
    }

    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_default_max_tokens(mut self, max_tokens: u64) -> Self {
        self.default_max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    /// Model ids this adapter was configured to serve.
    #[must_use]
    pub fn models(&self) -> &[String] {
        &self.models
    }

    fn endpoint_path(&self) -> &'static str {
        match self.kind {
            ProviderKind::Anthropic => "messages",
            ProviderKind::OpenAiResponses => "responses",
            ProviderKind::OpenAiChat | ProviderKind::OpenAiCompatible => "chat/completions",
        }
    }

    fn endpoint_url(&self, path: &str) -> Result<url::Url, EngineError> {
        let base = url::Url::parse(&self.base_url).map_err(|e| {
            EngineError::InvalidRequest(format!("provider '{}' base URL: {e}", self.name))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(EngineError::InvalidRequest(format!(
                "provider '{}' base URL must use http or https",
                self.name
            )));
        }
        url::Url::parse(&join_endpoint(&base, path)).map_err(|e| {
            EngineError::InvalidRequest(format!("provider '{}' endpoint URL: {e}", self.name))
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap, EngineError> {
        let invalid =
            |e: http::header::InvalidHeaderValue| EngineError::InvalidRequest(format!("api key header: {e}"));
        let mut headers = HeaderMap::new();
        match self.kind {
            ProviderKind::Anthropic => {
                let mut key = HeaderValue::from_str(&self.api_key).map_err(invalid)?;
                key.set_sensitive(true);
                headers.insert("x-api-key", key);
                let version = self
                    .api_version
                    .as_deref()
                    .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_str(version).map_err(invalid)?,
                );
            }
            ProviderKind::OpenAiResponses
            | ProviderKind::OpenAiChat
            | ProviderKind::OpenAiCompatible => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                    .map_err(invalid)?;
                value.set_sensitive(true);
                headers.insert(http::header::AUTHORIZATION, value);
            }
        }
        Ok(headers)
    }
}

fn single_error(err: EngineError) -> EventStream {
    Box::pin(futures_util::stream::once(async move {
        StreamEvent::Error(err)
    }))
}

fn with_turn_logging(
    events: EventStream,
    provider: String,
    model: String,
    started: Instant,
) -> EventStream {
    Box::pin(events.inspect(move |event| {
        if let StreamEvent::MessageEnd { usage, .. } = event {
            log_turn_complete(&provider, &model, usage.as_ref(), started.elapsed());
        }
    }))
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send_message(&self, request: TurnRequest<'_>) -> Result<EventStream, EngineError> {
        let dialect = self.kind.dialect();
        let body = build_wire_body(self.kind, &request, self.default_max_tokens)?;
        let url = self.endpoint_url(self.endpoint_path())?;
        let mut headers = self.auth_headers()?;
        if request.streaming {
            headers.insert(
                http::header::ACCEPT,
                HeaderValue::from_static("text/event-stream"),
            );
        }
        let call = HttpCall::post_json(url, headers, &body)?;
        let started = Instant::now();
        let cancel = request.cancel.clone();
        tracing::debug!(provider = %self.name, model = request.model, ?dialect, streaming = request.streaming, "sending turn");

        let events: EventStream = if request.streaming {
            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Box::pin(futures_util::stream::empty())),
                opened = self.transport.open_stream(call) => opened,
            };
            match opened {
                Ok(raw) => decode_event_stream(raw, decoder_for(dialect), cancel),
                Err(err) => single_error(err),
            }
        } else {
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Box::pin(futures_util::stream::empty())),
                sent = self.transport.send(call) => sent,
            };
            match sent.and_then(|body| decode_response(dialect, &body)) {
                Ok(events) => Box::pin(futures_util::stream::iter(events)),
                Err(err) => single_error(err),
            }
        };
        Ok(with_turn_logging(
            events,
            self.name.clone(),
            request.model.to_string(),
            started,
        ))
    }

    async fn fetch_available_models(&self) -> Result<Vec<ModelInfo>, EngineError> {
        let url = self.endpoint_url("models")?;
        let body = self
            .transport
            .get(HttpCall::get(url, self.auth_headers()?))
            .await?;
        parse_model_list(&body)
    }

    async fn validate_api_key(&self) -> Result<bool, EngineError> {
        match self.fetch_available_models().await {
            Ok(_) => Ok(true),
            Err(err)
                if matches!(
                    err.category(),
                    ErrorCategory::Authentication | ErrorCategory::Permission
                ) =>
            {
                tracing::warn!(provider = %self.name, error = %err, "api key rejected");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::RawEventStream;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn open_stream(&self, _call: HttpCall) -> Result<RawEventStream, EngineError> {
            Err(EngineError::Transport("offline".to_string()))
        }

        async fn send(&self, _call: HttpCall) -> Result<String, EngineError> {
            Err(EngineError::Transport("offline".to_string()))
        }
    }

    fn adapter(kind: ProviderKind, base_url: &str) -> HttpAdapter {
        HttpAdapter::new("p", kind, base_url, "secret", Arc::new(NoTransport))
    }

    #[test]
    fn test_endpoints_and_headers() {
        let anthropic = adapter(ProviderKind::Anthropic, "https://api.anthropic.com/v1/");
        assert_eq!(
            anthropic.endpoint_url(anthropic.endpoint_path()).expect("url").as_str(),
            "https://api.anthropic.com/v1/messages"
        );
        let headers = anthropic.auth_headers().expect("headers");
        assert_eq!(headers["x-api-key"], "secret");
        assert_eq!(headers["anthropic-version"], DEFAULT_ANTHROPIC_VERSION);
        assert!(headers["x-api-key"].is_sensitive());

        let chat = adapter(ProviderKind::OpenAiCompatible, "http://localhost:8080/v1");
        assert_eq!(
            chat.endpoint_url(chat.endpoint_path()).expect("url").as_str(),
            "http://localhost:8080/v1/chat/completions"
        );
        let headers = chat.auth_headers().expect("headers");
        assert_eq!(headers["authorization"], "Bearer secret");
        assert!(headers["authorization"].is_sensitive());
    }

    #[test]
    fn test_unusable_base_url() {
        let bad = adapter(ProviderKind::OpenAiChat, "ftp://example.com");
        assert!(matches!(
            bad.endpoint_url("models"),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_is_terminal_item() {
        let adapter = adapter(ProviderKind::OpenAiChat, "https://api.example.com/v1");
        let history = vec![crate::protocol::canonical::Message::user("hi")];
        let stream = adapter
            .send_message(TurnRequest::new(&history, "m"))
            .await
            .expect("stream");
        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![StreamEvent::Error(EngineError::Transport("offline".to_string()))]
        );
    }
}
