use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::util::{new_message_id, unix_now_secs};

/// Structured tool arguments, keys unique.
pub type ToolArguments = serde_json::Map<String, Value>;

/// The three incremental event encodings the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Blocks addressed by a 0-based index: open, delta, close.
    IndexedBlocks,
    /// Output items addressed by a server-assigned string id.
    OutputItems,
    /// Chat chunks whose `delta` merges text, reasoning and indexed tool calls.
    ChatChunks,
}

/// The kind of provider an upstream service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    OpenAiResponses,
    OpenAiChat,
    /// Any endpoint that speaks the chat-completions stream shape.
    OpenAiCompatible,
}

impl ProviderKind {
    #[must_use]
    pub fn dialect(self) -> Dialect {
        match self {
            ProviderKind::Anthropic => Dialect::IndexedBlocks,
            ProviderKind::OpenAiResponses => Dialect::OutputItems,
            ProviderKind::OpenAiChat | ProviderKind::OpenAiCompatible => Dialect::ChatChunks,
        }
    }

    /// Parse the provider name used in configuration files.
    #[must_use]
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "anthropic" => Some(ProviderKind::Anthropic),
            "openai-responses" => Some(ProviderKind::OpenAiResponses),
            "openai" => Some(ProviderKind::OpenAiChat),
            "openai-compatible" => Some(ProviderKind::OpenAiCompatible),
            _ => None,
        }
    }
}

/// Canonical message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Provider-opaque signature attached to reasoning or tool calls.
///
/// Deliberately has no `Display` and no conversion into plain strings: a
/// signature is only meaningful to the dialect that produced it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Append an incrementally streamed signature fragment.
    pub fn push_fragment(&mut self, fragment: &str) {
        self.0.push_str(fragment);
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(<{} bytes>)", self.0.len())
    }
}

/// Redacted reasoning payload; opaque to everything but its producer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedactedBlob(String);

impl RedactedBlob {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RedactedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedactedBlob(<{} bytes>)", self.0.len())
    }
}

/// Where an attachment's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaSource {
    Url(String),
    Base64 { media_type: String, data: String },
}

/// A single part of a message's visible or reasoning content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image(MediaSource),
    Audio(MediaSource),
    Video(MediaSource),
    File {
        source: MediaSource,
        name: Option<String>,
    },
    Thinking {
        text: String,
        signature: Option<Signature>,
    },
    RedactedThinking(RedactedBlob),
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(text.into())
    }

    /// Reasoning parts are opaque and never portable across dialects.
    #[must_use]
    pub fn is_reasoning(&self) -> bool {
        matches!(
            self,
            ContentPart::Thinking { .. } | ContentPart::RedactedThinking(_)
        )
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
    pub signature: Option<Signature>,
}

impl ToolCall {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            signature: None,
        }
    }
}

/// The outcome of a tool invocation, keyed by the call id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: Option<String>,
    pub content: String,
    pub is_error: bool,
    pub signature: Option<Signature>,
}

impl ToolResult {
    #[must_use]
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: None,
            content: content.into(),
            is_error: false,
            signature: None,
        }
    }

    #[must_use]
    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::success(tool_call_id, content)
        }
    }
}

/// One message of the caller-owned conversation history.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub timestamp: u64,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: unix_now_secs(),
        }
    }

    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    #[must_use]
    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[must_use]
    pub fn tool(results: Vec<ToolResult>) -> Self {
        Self::new(Role::Tool, Vec::new()).with_tool_results(results)
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: Vec<ContentPart>) -> Self {
        self.content = content;
        self
    }

    #[must_use]
    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    #[must_use]
    pub fn with_tool_results(mut self, results: Vec<ToolResult>) -> Self {
        self.tool_results = results;
        self
    }

    /// Concatenated visible text parts.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// Token usage for a finished turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub service_tier: Option<String>,
    pub region: Option<String>,
}

/// A sparse usage fragment as reported mid-stream. Unset fields are unknown,
/// not zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub thinking_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub service_tier: Option<String>,
    pub region: Option<String>,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    EndOfTurn,
    ToolCalls,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    InProgress,
    Searching,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSource {
    pub url: String,
    pub title: Option<String>,
}

/// Progress of a provider-side web search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchActivity {
    pub id: String,
    pub status: SearchStatus,
    pub query: Option<String>,
    pub sources: Vec<SearchSource>,
}

impl SearchActivity {
    #[must_use]
    pub fn new(id: impl Into<String>, status: SearchStatus) -> Self {
        Self {
            id: id.into(),
            status,
            query: None,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentDelta {
    Text(String),
    Image(MediaSource),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingDelta {
    Thinking {
        text: String,
        signature: Option<Signature>,
    },
    Redacted(RedactedBlob),
}

/// A single canonical, dialect-independent stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        id: String,
    },
    ContentDelta(ContentDelta),
    ThinkingDelta(ThinkingDelta),
    ToolCallStart(ToolCall),
    ToolCallDelta {
        id: String,
        fragment: String,
    },
    ToolCallEnd(ToolCall),
    SearchActivity(SearchActivity),
    MessageEnd {
        usage: Option<Usage>,
        stop_reason: Option<StopReason>,
    },
    Error(EngineError),
}

impl StreamEvent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::ContentDelta(ContentDelta::Text(text.into()))
    }

    #[must_use]
    pub fn thinking(text: impl Into<String>) -> Self {
        StreamEvent::ThinkingDelta(ThinkingDelta::Thinking {
            text: text.into(),
            signature: None,
        })
    }

    /// `MessageEnd` and `Error` close a turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageEnd { .. } | StreamEvent::Error(_))
    }
}

/// A tool's function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

/// A model the provider reports as available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasoningControl {
    /// Named effort level (`low`, `medium`, `high`).
    Effort(String),
    /// Explicit thinking budget in tokens.
    BudgetTokens(u64),
}

/// Generation parameters for a turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationControls {
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    pub reasoning: Option<ReasoningControl>,
    pub web_search: bool,
    pub overrides: ProviderOverrides,
}

/// Override keys the engine interprets itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservedOverride {
    ServiceTier(String),
    ParallelToolCalls(bool),
    Store(bool),
    IncludeUsage(bool),
}

impl ReservedOverride {
    const KEYS: [&'static str; 4] = [
        "service_tier",
        "parallel_tool_calls",
        "store",
        "include_usage",
    ];

    fn parse(key: &str, value: &Value) -> Option<Result<Self, EngineError>> {
        if !Self::KEYS.contains(&key) {
            return None;
        }
        let parsed = match (key, value) {
            ("service_tier", Value::String(tier)) => Ok(ReservedOverride::ServiceTier(tier.clone())),
            ("parallel_tool_calls", Value::Bool(flag)) => {
                Ok(ReservedOverride::ParallelToolCalls(*flag))
            }
            ("store", Value::Bool(flag)) => Ok(ReservedOverride::Store(*flag)),
            ("include_usage", Value::Bool(flag)) => Ok(ReservedOverride::IncludeUsage(*flag)),
            _ => Err(EngineError::InvalidRequest(format!(
                "override '{key}' has an unexpected value type"
            ))),
        };
        Some(parsed)
    }
}

/// One provider-specific override.
#[derive(Debug, Clone, PartialEq)]
pub enum Override {
    Reserved(ReservedOverride),
    Passthrough { key: String, value: Value },
}

/// Ordered provider overrides; passthrough pairs are merged into the wire
/// body last, later pairs winning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOverrides {
    entries: Vec<Override>,
}

impl ProviderOverrides {
    /// Split raw `(key, value)` pairs into reserved and passthrough overrides.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] when a reserved key carries a
    /// value of the wrong JSON type.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut entries = Vec::new();
        for (key, value) in pairs {
            let key = key.into();
            match ReservedOverride::parse(&key, &value) {
                Some(reserved) => entries.push(Override::Reserved(reserved?)),
                None => entries.push(Override::Passthrough { key, value }),
            }
        }
        Ok(Self { entries })
    }

    pub fn push(&mut self, entry: Override) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserved(&self) -> impl Iterator<Item = &ReservedOverride> {
        self.entries.iter().filter_map(|entry| match entry {
            Override::Reserved(reserved) => Some(reserved),
            Override::Passthrough { .. } => None,
        })
    }

    #[must_use]
    pub fn service_tier(&self) -> Option<&str> {
        self.reserved().fold(None, |found, entry| match entry {
            ReservedOverride::ServiceTier(tier) => Some(tier.as_str()),
            _ => found,
        })
    }

    #[must_use]
    pub fn parallel_tool_calls(&self) -> Option<bool> {
        self.reserved().fold(None, |found, entry| match entry {
            ReservedOverride::ParallelToolCalls(flag) => Some(*flag),
            _ => found,
        })
    }

    #[must_use]
    pub fn store(&self) -> Option<bool> {
        self.reserved().fold(None, |found, entry| match entry {
            ReservedOverride::Store(flag) => Some(*flag),
            _ => found,
        })
    }

    #[must_use]
    pub fn include_usage(&self) -> Option<bool> {
        self.reserved().fold(None, |found, entry| match entry {
            ReservedOverride::IncludeUsage(flag) => Some(*flag),
            _ => found,
        })
    }

    /// Merge passthrough pairs into a serialized wire body, in order.
    pub fn merge_passthrough_into(&self, body: &mut serde_json::Map<String, Value>) {
        for entry in &self.entries {
            if let Override::Passthrough { key, value } = entry {
                body.insert(key.clone(), value.clone());
            }
        }
    }
}
