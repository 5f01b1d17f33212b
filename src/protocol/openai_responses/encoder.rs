use crate::error::EngineError;
use crate::protocol::canonical::{ContentPart, MediaSource, Message, ReasoningControl, Role};
use crate::protocol::openai_responses::{
    ResponsesInputContent, ResponsesInputItem, ResponsesReasoning, ResponsesRequest, ResponsesTool,
};
use crate::protocol::{effort_for_budget, TurnParts};

/// Build a Responses API request from a normalized history.
///
/// System text becomes `instructions`; assistant tool calls and tool results
/// become standalone `function_call` / `function_call_output` items.
///
/// # Errors
///
/// Returns [`EngineError::InvalidRequest`] when a tool call's arguments
/// cannot be serialized.
pub fn build_responses_request(parts: &TurnParts<'_>) -> Result<ResponsesRequest, EngineError> {
    let mut instructions = Vec::new();
    let mut input = Vec::with_capacity(parts.history.len());
    for message in parts.history {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    instructions.push(text);
                }
            }
            Role::User => {
                let content = encode_user_content(message);
                if !content.is_empty() {
                    input.push(ResponsesInputItem::Message {
                        role: "user".to_string(),
                        content,
                    });
                }
            }
            Role::Assistant => encode_assistant(message, &mut input)?,
            Role::Tool => {
                for result in &message.tool_results {
                    input.push(ResponsesInputItem::FunctionCallOutput {
                        call_id: result.tool_call_id.clone(),
                        output: result.content.clone(),
                    });
                }
            }
        }
    }

    let controls = parts.controls;
    if !controls.stop.is_empty() {
        tracing::debug!("stop sequences are not supported by the responses dialect; ignored");
    }
    let reasoning = controls.reasoning.as_ref().map(|reasoning| ResponsesReasoning {
        effort: Some(match reasoning {
            ReasoningControl::Effort(effort) => effort.clone(),
            ReasoningControl::BudgetTokens(budget) => effort_for_budget(*budget).to_string(),
        }),
        summary: Some("auto".to_string()),
    });
    let store = controls.overrides.store();
    // without server-side storage, reasoning can only be replayed encrypted
    let include = if store == Some(false) && reasoning.is_some() {
        vec!["reasoning.encrypted_content".to_string()]
    } else {
        Vec::new()
    };

    let mut tools: Vec<ResponsesTool> = parts
        .tools
        .iter()
        .map(|tool| ResponsesTool::Function {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        })
        .collect();
    if controls.web_search {
        tools.push(ResponsesTool::WebSearch);
    }

    Ok(ResponsesRequest {
        model: parts.model.to_string(),
        input,
        instructions: (!instructions.is_empty()).then(|| instructions.join("\n\n")),
        parallel_tool_calls: controls
            .overrides
            .parallel_tool_calls()
            .filter(|_| !tools.is_empty()),
        tools,
        store,
        stream: parts.stream.then_some(true),
        temperature: controls.temperature,
        top_p: controls.top_p,
        max_output_tokens: controls.max_tokens,
        reasoning,
        service_tier: controls.overrides.service_tier().map(str::to_string),
        include,
    })
}

fn data_url(media_type: &str, data: &str) -> String {
    format!("data:{media_type};base64,{data}")
}

fn encode_user_content(message: &Message) -> Vec<ResponsesInputContent> {
    let mut content = Vec::with_capacity(message.content.len());
    for part in &message.content {
        match part {
            ContentPart::Text(text) => content.push(ResponsesInputContent::InputText {
                text: text.clone(),
            }),
            ContentPart::Image(source) => content.push(ResponsesInputContent::InputImage {
                image_url: match source {
                    MediaSource::Url(url) => url.clone(),
                    MediaSource::Base64 { media_type, data } => data_url(media_type, data),
                },
            }),
            ContentPart::File { source, name } => {
                let (file_url, file_data) = match source {
                    MediaSource::Url(url) => (Some(url.clone()), None),
                    MediaSource::Base64 { media_type, data } => {
                        (None, Some(data_url(media_type, data)))
                    }
                };
                content.push(ResponsesInputContent::InputFile {
                    file_url,
                    file_data,
                    filename: name.clone(),
                });
            }
            ContentPart::Audio(_) | ContentPart::Video(_) => {
                tracing::warn!("audio and video attachments are not supported by this dialect; dropped");
            }
            ContentPart::Thinking { .. } | ContentPart::RedactedThinking(_) => {}
        }
    }
    content
}

fn encode_assistant(message: &Message, input: &mut Vec<ResponsesInputItem>) -> Result<(), EngineError> {
    let text = message.text();
    if !text.is_empty() {
        input.push(ResponsesInputItem::Message {
            role: "assistant".to_string(),
            content: vec![ResponsesInputContent::OutputText { text }],
        });
    }
    for call in &message.tool_calls {
        let arguments = serde_json::to_string(&call.arguments).map_err(|e| {
            EngineError::InvalidRequest(format!("tool call {} arguments: {e}", call.id))
        })?;
        input.push(ResponsesInputItem::FunctionCall {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        });
    }
    Ok(())
}
