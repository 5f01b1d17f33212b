use serde_json::Value;

use crate::error::EngineError;
use crate::protocol::anthropic::{
    search_query, search_result_activity, stop_reason_from_wire, AnthropicContentBlock,
    AnthropicResponse,
};
use crate::protocol::canonical::{
    RedactedBlob, SearchActivity, SearchStatus, Signature, StopReason, StreamEvent, ThinkingDelta,
};
use crate::stream::{ToolCallAccumulator, UsageAccumulator};

/// Replay a complete (non-streaming) Messages response as canonical events.
///
/// # Errors
///
/// Returns [`EngineError::Decoding`] when the body is not a Messages response.
pub fn decode_anthropic_response(body: &str) -> Result<Vec<StreamEvent>, EngineError> {
    let response: AnthropicResponse = serde_json::from_str(body)
        .map_err(|e| EngineError::Decoding(format!("malformed messages response: {e}")))?;
    Ok(replay_response(response))
}

fn replay_response(response: AnthropicResponse) -> Vec<StreamEvent> {
    let mut out = Vec::with_capacity(response.content.len() + 2);
    out.push(StreamEvent::MessageStart { id: response.id });

    let mut tools = ToolCallAccumulator::new();
    let mut queries: Vec<(String, Option<String>)> = Vec::new();
    for (index, block) in response.content.into_iter().enumerate() {
        match block {
            AnthropicContentBlock::Text { text } => {
                if !text.is_empty() {
                    out.push(StreamEvent::text(text));
                }
            }
            AnthropicContentBlock::Thinking {
                thinking,
                signature,
            } => out.push(StreamEvent::ThinkingDelta(ThinkingDelta::Thinking {
                text: thinking,
                signature: signature.filter(|sig| !sig.is_empty()).map(Signature::new),
            })),
            AnthropicContentBlock::RedactedThinking { data } => out.push(
                StreamEvent::ThinkingDelta(ThinkingDelta::Redacted(RedactedBlob::new(data))),
            ),
            AnthropicContentBlock::ToolUse { id, name, input } => {
                tools.start(index, &id, &name, &mut out);
                let arguments = match &input {
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                tools.append(&index, &arguments, &mut out);
                tools.finish(&index, &mut out);
            }
            AnthropicContentBlock::ServerToolUse { id, name, input } if name == "web_search" => {
                let mut activity = SearchActivity::new(id.clone(), SearchStatus::Searching);
                activity.query = search_query(&input);
                queries.push((id, activity.query.clone()));
                out.push(StreamEvent::SearchActivity(activity));
            }
            AnthropicContentBlock::WebSearchToolResult {
                tool_use_id,
                content,
            } => {
                let mut activity = search_result_activity(&tool_use_id, &content);
                activity.query = queries
                    .iter()
                    .find(|(id, _)| *id == tool_use_id)
                    .and_then(|(_, query)| query.clone());
                out.push(StreamEvent::SearchActivity(activity));
            }
            _ => {}
        }
    }

    let mut usage = UsageAccumulator::new();
    if let Some(wire) = &response.usage {
        usage.merge(wire.to_partial());
    }
    let stop_reason = response
        .stop_reason
        .as_deref()
        .and_then(stop_reason_from_wire)
        .or(Some(StopReason::EndOfTurn));
    out.push(StreamEvent::MessageEnd {
        usage: usage.finalize(),
        stop_reason,
    });
    if stop_reason == Some(StopReason::ContentFilter) {
        out.push(StreamEvent::Error(EngineError::ContentFiltered(
            "the provider refused to continue this response".to_string(),
        )));
    }
    out
}
