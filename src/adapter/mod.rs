//! Provider adapters: the façade a client drives one turn through.
//!
//! Every adapter runs the same pipeline: normalize history, build the
//! dialect's wire request, preflight it, send it, and decode the reply into
//! canonical [`StreamEvent`](crate::protocol::canonical::StreamEvent)s.

pub mod http;
pub mod registry;
pub mod socket;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::history::{normalize_history, preflight};
use crate::protocol::anthropic::encoder::build_anthropic_request;
use crate::protocol::anthropic::response_decoder::decode_anthropic_response;
use crate::protocol::canonical::{
    Dialect, GenerationControls, Message, ModelInfo, ProviderKind, StreamEvent, ToolSpec,
};
use crate::protocol::openai_chat::encoder::build_chat_request;
use crate::protocol::openai_chat::response_decoder::decode_chat_response;
use crate::protocol::openai_responses::encoder::build_responses_request;
use crate::protocol::openai_responses::response_decoder::decode_responses_response;
use crate::protocol::{to_wire_body, TurnParts};
use crate::stream::EventStream;

pub use http::HttpAdapter;
pub use registry::AdapterRegistry;
pub use socket::{FrameSink, FrameSource, PersistentConnection, TurnHandle};

/// Everything needed to run one turn. The history stays caller-owned.
#[derive(Debug, Clone)]
pub struct TurnRequest<'a> {
    pub history: &'a [Message],
    pub model: &'a str,
    pub controls: GenerationControls,
    pub tools: Vec<ToolSpec>,
    pub streaming: bool,
    pub cancel: CancellationToken,
}

impl<'a> TurnRequest<'a> {
    /// A streaming turn with default controls and no tools.
    #[must_use]
    pub fn new(history: &'a [Message], model: &'a str) -> Self {
        Self {
            history,
            model,
            controls: GenerationControls::default(),
            tools: Vec::new(),
            streaming: true,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_controls(mut self, controls: GenerationControls) -> Self {
        self.controls = controls;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A provider the engine can run turns against.
///
/// `send_message` returns `Err` only for failures detected before anything is
/// sent; once the request is on the wire, failures arrive as the stream's
/// terminal `Error` item.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn send_message(&self, request: TurnRequest<'_>) -> Result<EventStream, EngineError>;

    async fn fetch_available_models(&self) -> Result<Vec<ModelInfo>, EngineError>;

    /// `Ok(false)` when the provider rejects the credentials.
    async fn validate_api_key(&self) -> Result<bool, EngineError>;
}

/// Normalize, build and preflight the wire body for one turn.
pub(crate) fn build_wire_body(
    kind: ProviderKind,
    request: &TurnRequest<'_>,
    default_max_tokens: u64,
) -> Result<Value, EngineError> {
    let dialect = kind.dialect();
    let history = normalize_history(request.history, dialect);
    let parts = TurnParts {
        model: request.model,
        history: &history,
        controls: &request.controls,
        tools: &request.tools,
        stream: request.streaming,
    };
    match dialect {
        Dialect::IndexedBlocks => {
            let wire = build_anthropic_request(&parts, default_max_tokens)?;
            preflight(&wire)?;
            to_wire_body(&wire, &request.controls)
        }
        Dialect::OutputItems => {
            let wire = build_responses_request(&parts)?;
            preflight(&wire)?;
            to_wire_body(&wire, &request.controls)
        }
        Dialect::ChatChunks => {
            let wire = build_chat_request(&parts)?;
            preflight(&wire)?;
            to_wire_body(&wire, &request.controls)
        }
    }
}

/// Replay a non-streaming response body in the dialect's event vocabulary.
pub(crate) fn decode_response(dialect: Dialect, body: &str) -> Result<Vec<StreamEvent>, EngineError> {
    match dialect {
        Dialect::IndexedBlocks => decode_anthropic_response(body),
        Dialect::OutputItems => decode_responses_response(body),
        Dialect::ChatChunks => decode_chat_response(body),
    }
}
