use serde_json::Value;

use crate::error::EngineError;
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicMessage, AnthropicRequest, AnthropicSource, AnthropicThinking,
    AnthropicToolDef,
};
use crate::protocol::canonical::{ContentPart, MediaSource, Message, ReasoningControl, Role};
use crate::protocol::{effort_budget_tokens, TurnParts};

const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";

/// Build an Anthropic Messages request from a normalized history.
///
/// System messages are hoisted into the top-level `system` field; tool
/// messages become user messages whose content starts with the results.
///
/// # Errors
///
/// Returns [`EngineError::InvalidRequest`] when the history contains no
/// conversational message.
pub fn build_anthropic_request(
    parts: &TurnParts<'_>,
    default_max_tokens: u64,
) -> Result<AnthropicRequest, EngineError> {
    let mut system = Vec::new();
    let mut messages = Vec::with_capacity(parts.history.len());
    for message in parts.history {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system.push(text);
                }
            }
            Role::User => messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: encode_user_content(message),
            }),
            Role::Assistant => messages.push(AnthropicMessage {
                role: "assistant".to_string(),
                content: encode_assistant_content(message),
            }),
            Role::Tool => messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: encode_tool_results(message),
            }),
        }
    }
    if messages.is_empty() {
        return Err(EngineError::InvalidRequest(
            "conversation has no user or assistant messages".to_string(),
        ));
    }

    let controls = parts.controls;
    let mut max_tokens = controls.max_tokens.unwrap_or(default_max_tokens);
    let thinking = controls.reasoning.as_ref().map(|reasoning| {
        let budget_tokens = match reasoning {
            ReasoningControl::BudgetTokens(budget) => *budget,
            ReasoningControl::Effort(effort) => effort_budget_tokens(effort),
        };
        AnthropicThinking {
            kind: "enabled".to_string(),
            budget_tokens,
        }
    });
    if let Some(thinking) = &thinking {
        // the budget is carved out of max_tokens
        max_tokens = max_tokens.max(thinking.budget_tokens + 1);
    }

    let mut tools: Vec<AnthropicToolDef> = parts
        .tools
        .iter()
        .map(|tool| AnthropicToolDef::Function {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
        })
        .collect();
    if controls.web_search {
        tools.push(AnthropicToolDef::Server {
            kind: WEB_SEARCH_TOOL_TYPE.to_string(),
            name: "web_search".to_string(),
        });
    }
    let tool_choice = match controls.overrides.parallel_tool_calls() {
        Some(false) if !tools.is_empty() => Some(serde_json::json!({
            "type": "auto",
            "disable_parallel_tool_use": true,
        })),
        _ => None,
    };

    Ok(AnthropicRequest {
        model: parts.model.to_string(),
        max_tokens,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages,
        tools,
        stream: parts.stream.then_some(true),
        temperature: controls.temperature,
        top_p: controls.top_p,
        stop_sequences: controls.stop.clone(),
        thinking,
        service_tier: controls.overrides.service_tier().map(str::to_string),
        tool_choice,
    })
}

fn encode_source(source: &MediaSource) -> AnthropicSource {
    match source {
        MediaSource::Url(url) => AnthropicSource::Url { url: url.clone() },
        MediaSource::Base64 { media_type, data } => AnthropicSource::Base64 {
            media_type: media_type.clone(),
            data: data.clone(),
        },
    }
}

fn encode_part(part: &ContentPart, out: &mut Vec<AnthropicContentBlock>) {
    match part {
        ContentPart::Text(text) => {
            if !text.is_empty() {
                out.push(AnthropicContentBlock::Text { text: text.clone() });
            }
        }
        ContentPart::Image(source) => out.push(AnthropicContentBlock::Image {
            source: encode_source(source),
        }),
        ContentPart::File { source, name } => out.push(AnthropicContentBlock::Document {
            source: encode_source(source),
            title: name.clone(),
        }),
        ContentPart::Audio(_) | ContentPart::Video(_) => {
            tracing::warn!("audio and video attachments are not supported by this dialect; dropped");
        }
        ContentPart::Thinking { text, signature } => out.push(AnthropicContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.as_ref().map(|sig| sig.expose().to_string()),
        }),
        ContentPart::RedactedThinking(blob) => out.push(AnthropicContentBlock::RedactedThinking {
            data: blob.expose().to_string(),
        }),
    }
}

fn encode_user_content(message: &Message) -> Vec<AnthropicContentBlock> {
    let mut blocks = Vec::with_capacity(message.content.len());
    for part in &message.content {
        encode_part(part, &mut blocks);
    }
    blocks
}

fn encode_assistant_content(message: &Message) -> Vec<AnthropicContentBlock> {
    let mut blocks = Vec::with_capacity(message.content.len() + message.tool_calls.len());
    // reasoning blocks must precede the visible content they belong to
    for part in message.content.iter().filter(|part| part.is_reasoning()) {
        encode_part(part, &mut blocks);
    }
    for part in message.content.iter().filter(|part| !part.is_reasoning()) {
        encode_part(part, &mut blocks);
    }
    for call in &message.tool_calls {
        blocks.push(AnthropicContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: Value::Object(call.arguments.clone()),
        });
    }
    blocks
}

fn encode_tool_results(message: &Message) -> Vec<AnthropicContentBlock> {
    let mut blocks: Vec<AnthropicContentBlock> = message
        .tool_results
        .iter()
        .map(|result| AnthropicContentBlock::ToolResult {
            tool_use_id: result.tool_call_id.clone(),
            content: result.content.clone(),
            is_error: result.is_error,
        })
        .collect();
    for part in &message.content {
        encode_part(part, &mut blocks);
    }
    blocks
}
