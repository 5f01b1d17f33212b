use std::fmt;

use rustc_hash::FxHashSet;

use crate::error::EngineError;
use crate::protocol::anthropic::{AnthropicContentBlock, AnthropicRequest};
use crate::protocol::canonical::{ContentPart, Message, Role};
use crate::protocol::openai_chat::{OpenAiChatRequest, OpenAiContent, OpenAiContentPart};
use crate::protocol::openai_responses::{ResponsesInputContent, ResponsesInputItem, ResponsesRequest};

/// Role of a wire-level entry. Tool results always travel in a `User` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireRole {
    System,
    User,
    Assistant,
}

impl WireRole {
    fn as_str(self) -> &'static str {
        match self {
            WireRole::System => "system",
            WireRole::User => "user",
            WireRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireBlockKind {
    Text,
    Media,
    Reasoning,
    ToolUse,
    ToolResult,
    Other,
}

impl WireBlockKind {
    fn as_str(self) -> &'static str {
        match self {
            WireBlockKind::Text => "text",
            WireBlockKind::Media => "media",
            WireBlockKind::Reasoning => "reasoning",
            WireBlockKind::ToolUse => "tool_use",
            WireBlockKind::ToolResult => "tool_result",
            WireBlockKind::Other => "other",
        }
    }
}

/// One content block of a wire entry; `id` is the call id for tool blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBlock {
    pub kind: WireBlockKind,
    pub id: Option<String>,
}

impl WireBlock {
    #[must_use]
    pub fn new(kind: WireBlockKind) -> Self {
        Self { kind, id: None }
    }

    #[must_use]
    pub fn tool_use(id: impl Into<String>) -> Self {
        Self {
            kind: WireBlockKind::ToolUse,
            id: Some(id.into()),
        }
    }

    #[must_use]
    pub fn tool_result(id: impl Into<String>) -> Self {
        Self {
            kind: WireBlockKind::ToolResult,
            id: Some(id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEntry {
    pub role: WireRole,
    pub blocks: Vec<WireBlock>,
}

impl WireEntry {
    #[must_use]
    pub fn new(role: WireRole, blocks: Vec<WireBlock>) -> Self {
        Self { role, blocks }
    }

    fn summary(&self, index: usize) -> String {
        let blocks: Vec<&str> = self.blocks.iter().map(|b| b.kind.as_str()).collect();
        format!("[{index}] {}[{}]", self.role.as_str(), blocks.join(", "))
    }
}

/// A request that can be projected onto role-tagged block sequences.
pub trait WireTranscript {
    fn wire_entries(&self) -> Vec<WireEntry>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// The assistant entry is the last one.
    NoFollowingEntry,
    /// The next entry exists but has the wrong role.
    WrongRole(WireRole),
    /// Results exist for these ids but not in the leading run of the next entry.
    ResultsNotFirst(Vec<String>),
    /// No result at all for these ids in the next entry.
    MissingResults(Vec<String>),
}

/// A tool-use entry that is not immediately answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub index: usize,
    pub kind: ViolationKind,
    /// Structural summary of the entries around `index`.
    pub context: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message {}: ", self.index)?;
        match &self.kind {
            ViolationKind::NoFollowingEntry => {
                f.write_str("tool use is not followed by any message")?;
            }
            ViolationKind::WrongRole(role) => {
                write!(f, "tool use is followed by a {} message", role.as_str())?;
            }
            ViolationKind::ResultsNotFirst(ids) => {
                write!(f, "results for [{}] are not at the start of the next message", ids.join(", "))?;
            }
            ViolationKind::MissingResults(ids) => {
                write!(f, "missing tool results for [{}]", ids.join(", "))?;
            }
        }
        write!(f, " (context: {})", self.context)
    }
}

/// Every place where a tool-use entry is not answered, first, by the next
/// entry.
#[must_use]
pub fn find_violations(entries: &[WireEntry]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.role != WireRole::Assistant {
            continue;
        }
        let use_ids: Vec<&str> = entry
            .blocks
            .iter()
            .filter(|b| b.kind == WireBlockKind::ToolUse)
            .filter_map(|b| b.id.as_deref())
            .collect();
        if use_ids.is_empty() {
            continue;
        }
        let context = || context_summary(entries, index);

        let Some(next) = entries.get(index + 1) else {
            violations.push(Violation {
                index,
                kind: ViolationKind::NoFollowingEntry,
                context: context(),
            });
            continue;
        };
        if next.role != WireRole::User {
            violations.push(Violation {
                index,
                kind: ViolationKind::WrongRole(next.role),
                context: context(),
            });
            continue;
        }

        let leading: FxHashSet<&str> = next
            .blocks
            .iter()
            .take_while(|b| b.kind == WireBlockKind::ToolResult)
            .filter_map(|b| b.id.as_deref())
            .collect();
        let anywhere: FxHashSet<&str> = next
            .blocks
            .iter()
            .filter(|b| b.kind == WireBlockKind::ToolResult)
            .filter_map(|b| b.id.as_deref())
            .collect();
        let mut late = Vec::new();
        let mut missing = Vec::new();
        for id in use_ids {
            if leading.contains(id) {
                continue;
            }
            if anywhere.contains(id) {
                late.push(id.to_string());
            } else {
                missing.push(id.to_string());
            }
        }
        if !late.is_empty() {
            violations.push(Violation {
                index,
                kind: ViolationKind::ResultsNotFirst(late),
                context: context(),
            });
        }
        if !missing.is_empty() {
            violations.push(Violation {
                index,
                kind: ViolationKind::MissingResults(missing),
                context: context(),
            });
        }
    }
    violations
}

fn context_summary(entries: &[WireEntry], index: usize) -> String {
    let start = index.saturating_sub(1);
    let end = (index + 2).min(entries.len());
    entries[start..end]
        .iter()
        .enumerate()
        .map(|(offset, entry)| entry.summary(start + offset))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reject a request whose transcript breaks the tool-use / tool-result
/// adjacency rule. Never mutates the request.
///
/// # Errors
///
/// Returns one [`EngineError::InvalidRequest`] listing every violation.
pub fn preflight<T: WireTranscript + ?Sized>(transcript: &T) -> Result<(), EngineError> {
    let violations = find_violations(&transcript.wire_entries());
    if violations.is_empty() {
        return Ok(());
    }
    let detail = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    tracing::warn!(violations = violations.len(), "preflight rejected request: {detail}");
    Err(EngineError::InvalidRequest(format!(
        "tool use without an immediately following result: {detail}"
    )))
}

impl WireTranscript for [WireEntry] {
    fn wire_entries(&self) -> Vec<WireEntry> {
        self.to_vec()
    }
}

impl WireTranscript for [Message] {
    fn wire_entries(&self) -> Vec<WireEntry> {
        self.iter()
            .map(|message| {
                let role = match message.role {
                    Role::System => WireRole::System,
                    Role::Assistant => WireRole::Assistant,
                    Role::User | Role::Tool => WireRole::User,
                };
                let mut blocks: Vec<WireBlock> = message
                    .tool_results
                    .iter()
                    .map(|r| WireBlock::tool_result(r.tool_call_id.clone()))
                    .collect();
                blocks.extend(message.content.iter().map(|part| {
                    WireBlock::new(match part {
                        ContentPart::Text(_) => WireBlockKind::Text,
                        ContentPart::Thinking { .. } | ContentPart::RedactedThinking(_) => {
                            WireBlockKind::Reasoning
                        }
                        ContentPart::Image(_)
                        | ContentPart::Audio(_)
                        | ContentPart::Video(_)
                        | ContentPart::File { .. } => WireBlockKind::Media,
                    })
                }));
                blocks.extend(message.tool_calls.iter().map(|c| WireBlock::tool_use(c.id.clone())));
                WireEntry::new(role, blocks)
            })
            .collect()
    }
}

impl WireTranscript for AnthropicRequest {
    fn wire_entries(&self) -> Vec<WireEntry> {
        self.messages
            .iter()
            .map(|message| {
                let role = if message.role == "assistant" {
                    WireRole::Assistant
                } else {
                    WireRole::User
                };
                let blocks = message
                    .content
                    .iter()
                    .map(|block| match block {
                        AnthropicContentBlock::Text { .. } => WireBlock::new(WireBlockKind::Text),
                        AnthropicContentBlock::Image { .. }
                        | AnthropicContentBlock::Document { .. } => {
                            WireBlock::new(WireBlockKind::Media)
                        }
                        AnthropicContentBlock::Thinking { .. }
                        | AnthropicContentBlock::RedactedThinking { .. } => {
                            WireBlock::new(WireBlockKind::Reasoning)
                        }
                        AnthropicContentBlock::ToolUse { id, .. } => WireBlock::tool_use(id.clone()),
                        AnthropicContentBlock::ToolResult { tool_use_id, .. } => {
                            WireBlock::tool_result(tool_use_id.clone())
                        }
                        // server tools are resolved inside the same turn
                        AnthropicContentBlock::ServerToolUse { .. }
                        | AnthropicContentBlock::WebSearchToolResult { .. }
                        | AnthropicContentBlock::Unknown => WireBlock::new(WireBlockKind::Other),
                    })
                    .collect();
                WireEntry::new(role, blocks)
            })
            .collect()
    }
}

impl WireTranscript for OpenAiChatRequest {
    /// Consecutive `tool` messages fold into one user entry.
    fn wire_entries(&self) -> Vec<WireEntry> {
        let mut entries: Vec<WireEntry> = Vec::with_capacity(self.messages.len());
        let mut in_tool_run = false;
        for message in &self.messages {
            if message.role == "tool" {
                let block = WireBlock::tool_result(message.tool_call_id.clone().unwrap_or_default());
                match entries.last_mut() {
                    Some(last) if in_tool_run => last.blocks.push(block),
                    _ => entries.push(WireEntry::new(WireRole::User, vec![block])),
                }
                in_tool_run = true;
                continue;
            }
            in_tool_run = false;
            let role = match message.role.as_str() {
                "assistant" => WireRole::Assistant,
                "system" | "developer" => WireRole::System,
                _ => WireRole::User,
            };
            let mut blocks = Vec::new();
            match &message.content {
                Some(OpenAiContent::Text(text)) if !text.is_empty() => {
                    blocks.push(WireBlock::new(WireBlockKind::Text));
                }
                Some(OpenAiContent::Parts(parts)) => {
                    blocks.extend(parts.iter().map(|part| {
                        WireBlock::new(match part {
                            OpenAiContentPart::Text { .. } => WireBlockKind::Text,
                            _ => WireBlockKind::Media,
                        })
                    }));
                }
                _ => {}
            }
            blocks.extend(message.tool_calls.iter().map(|c| WireBlock::tool_use(c.id.clone())));
            entries.push(WireEntry::new(role, blocks));
        }
        entries
    }
}

impl WireTranscript for ResponsesRequest {
    /// Standalone `function_call` items join the preceding assistant entry and
    /// `function_call_output` items join a preceding run of outputs.
    fn wire_entries(&self) -> Vec<WireEntry> {
        let mut entries: Vec<WireEntry> = Vec::with_capacity(self.input.len());
        let mut in_output_run = false;
        for item in &self.input {
            match item {
                ResponsesInputItem::Message { role, content } => {
                    in_output_run = false;
                    let role = match role.as_str() {
                        "assistant" => WireRole::Assistant,
                        "system" | "developer" => WireRole::System,
                        _ => WireRole::User,
                    };
                    let blocks = content
                        .iter()
                        .map(|part| {
                            WireBlock::new(match part {
                                ResponsesInputContent::InputText { .. }
                                | ResponsesInputContent::OutputText { .. } => WireBlockKind::Text,
                                ResponsesInputContent::InputImage { .. }
                                | ResponsesInputContent::InputFile { .. } => WireBlockKind::Media,
                            })
                        })
                        .collect();
                    entries.push(WireEntry::new(role, blocks));
                }
                ResponsesInputItem::FunctionCall { call_id, .. } => {
                    in_output_run = false;
                    let block = WireBlock::tool_use(call_id.clone());
                    match entries.last_mut() {
                        Some(last) if last.role == WireRole::Assistant => last.blocks.push(block),
                        _ => entries.push(WireEntry::new(WireRole::Assistant, vec![block])),
                    }
                }
                ResponsesInputItem::FunctionCallOutput { call_id, .. } => {
                    let block = WireBlock::tool_result(call_id.clone());
                    match entries.last_mut() {
                        Some(last) if in_output_run => last.blocks.push(block),
                        _ => entries.push(WireEntry::new(WireRole::User, vec![block])),
                    }
                    in_output_run = true;
                }
            }
        }
        entries
    }
}
