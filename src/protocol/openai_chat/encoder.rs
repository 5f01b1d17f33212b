use serde_json::json;

use crate::error::EngineError;
use crate::protocol::canonical::{ContentPart, MediaSource, Message, ReasoningControl, Role};
use crate::protocol::openai_chat::{
    OpenAiChatRequest, OpenAiContent, OpenAiContentPart, OpenAiFile, OpenAiImageUrl,
    OpenAiInputAudio, OpenAiMessage, OpenAiStreamOptions, OpenAiTool, OpenAiToolCall,
    OpenAiToolCallFunction, OpenAiToolFunction,
};
use crate::protocol::{effort_for_budget, TurnParts};

/// Build a Chat Completions request from a normalized history.
///
/// Each tool result becomes its own `tool` message; reasoning parts are not
/// representable in this dialect and are left out.
///
/// # Errors
///
/// Returns [`EngineError::InvalidRequest`] when a tool call's arguments
/// cannot be serialized.
pub fn build_chat_request(parts: &TurnParts<'_>) -> Result<OpenAiChatRequest, EngineError> {
    let mut messages = Vec::with_capacity(parts.history.len());
    for message in parts.history {
        match message.role {
            Role::System => messages.push(OpenAiMessage::text("system", message.text())),
            Role::User => messages.push(OpenAiMessage {
                content: Some(encode_user_content(message)),
                ..OpenAiMessage::text("user", String::new())
            }),
            Role::Assistant => messages.push(encode_assistant(message)?),
            Role::Tool => {
                for result in &message.tool_results {
                    messages.push(OpenAiMessage {
                        tool_call_id: Some(result.tool_call_id.clone()),
                        ..OpenAiMessage::text("tool", result.content.clone())
                    });
                }
            }
        }
    }

    let controls = parts.controls;
    let reasoning_effort = controls.reasoning.as_ref().map(|reasoning| match reasoning {
        ReasoningControl::Effort(effort) => effort.clone(),
        ReasoningControl::BudgetTokens(budget) => effort_for_budget(*budget).to_string(),
    });
    // reasoning models reject `max_tokens`
    let (max_tokens, max_completion_tokens) = if reasoning_effort.is_some() {
        (None, controls.max_tokens)
    } else {
        (controls.max_tokens, None)
    };
    let tools: Vec<OpenAiTool> = parts
        .tools
        .iter()
        .map(|tool| OpenAiTool {
            kind: "function".to_string(),
            function: OpenAiToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        })
        .collect();
    let stream_options = parts.stream.then(|| OpenAiStreamOptions {
        include_usage: controls.overrides.include_usage().unwrap_or(true),
    });

    Ok(OpenAiChatRequest {
        model: parts.model.to_string(),
        messages,
        parallel_tool_calls: controls
            .overrides
            .parallel_tool_calls()
            .filter(|_| !tools.is_empty()),
        tools,
        stream: parts.stream.then_some(true),
        stream_options,
        temperature: controls.temperature,
        top_p: controls.top_p,
        max_tokens,
        max_completion_tokens,
        stop: controls.stop.clone(),
        reasoning_effort,
        service_tier: controls.overrides.service_tier().map(str::to_string),
        store: controls.overrides.store(),
        web_search_options: controls.web_search.then(|| json!({})),
    })
}

fn data_url(media_type: &str, data: &str) -> String {
    format!("data:{media_type};base64,{data}")
}

fn encode_user_content(message: &Message) -> OpenAiContent {
    let only_text = message
        .content
        .iter()
        .all(|part| matches!(part, ContentPart::Text(_)) || part.is_reasoning());
    if only_text {
        return OpenAiContent::Text(message.text());
    }

    let mut parts = Vec::with_capacity(message.content.len());
    for part in &message.content {
        match part {
            ContentPart::Text(text) => parts.push(OpenAiContentPart::Text { text: text.clone() }),
            ContentPart::Image(source) => parts.push(OpenAiContentPart::ImageUrl {
                image_url: OpenAiImageUrl {
                    url: match source {
                        MediaSource::Url(url) => url.clone(),
                        MediaSource::Base64 { media_type, data } => data_url(media_type, data),
                    },
                },
            }),
            ContentPart::Audio(MediaSource::Base64 { media_type, data }) => {
                let format = media_type
                    .rsplit('/')
                    .next()
                    .unwrap_or(media_type.as_str())
                    .to_string();
                parts.push(OpenAiContentPart::InputAudio {
                    input_audio: OpenAiInputAudio {
                        data: data.clone(),
                        format,
                    },
                });
            }
            ContentPart::File {
                source: MediaSource::Base64 { media_type, data },
                name,
            } => parts.push(OpenAiContentPart::File {
                file: OpenAiFile {
                    file_data: Some(data_url(media_type, data)),
                    filename: name.clone(),
                },
            }),
            ContentPart::Audio(MediaSource::Url(_))
            | ContentPart::File {
                source: MediaSource::Url(_),
                ..
            } => {
                tracing::warn!("url-referenced audio and files are not supported by this dialect; dropped");
            }
            ContentPart::Video(_) => {
                tracing::warn!("video attachments are not supported by this dialect; dropped");
            }
            ContentPart::Thinking { .. } | ContentPart::RedactedThinking(_) => {}
        }
    }
    OpenAiContent::Parts(parts)
}

fn encode_assistant(message: &Message) -> Result<OpenAiMessage, EngineError> {
    let mut tool_calls = Vec::with_capacity(message.tool_calls.len());
    for call in &message.tool_calls {
        let arguments = serde_json::to_string(&call.arguments).map_err(|e| {
            EngineError::InvalidRequest(format!("tool call {} arguments: {e}", call.id))
        })?;
        let extra_content = call
            .signature
            .as_ref()
            .map(|sig| json!({"google": {"thought_signature": sig.expose()}}));
        tool_calls.push(OpenAiToolCall {
            id: call.id.clone(),
            kind: "function".to_string(),
            function: OpenAiToolCallFunction {
                name: call.name.clone(),
                arguments,
            },
            extra_content,
        });
    }
    let text = message.text();
    Ok(OpenAiMessage {
        // a tool-call-only turn carries null content
        content: (!text.is_empty() || tool_calls.is_empty()).then_some(OpenAiContent::Text(text)),
        tool_calls,
        ..OpenAiMessage::text("assistant", String::new())
    })
}
