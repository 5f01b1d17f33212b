use crate::error::EngineError;
use crate::protocol::canonical::StreamEvent;
use crate::protocol::openai_chat::stream::ChunkStreamDecoder;
use crate::protocol::openai_chat::{
    OpenAiChatResponse, OpenAiDelta, OpenAiStreamChoice, OpenAiStreamChunk, OpenAiStreamToolCall,
    OpenAiStreamToolCallFunction,
};
use crate::stream::StreamDecoder;

/// Replay a complete (non-streaming) chat completion as canonical events.
///
/// The first choice is rewritten as a single chunk carrying the whole
/// message, so tool calls go through the same staging as streamed ones.
///
/// # Errors
///
/// Returns [`EngineError::Decoding`] when the body is not a chat completion.
pub fn decode_chat_response(body: &str) -> Result<Vec<StreamEvent>, EngineError> {
    let response: OpenAiChatResponse = serde_json::from_str(body)
        .map_err(|e| EngineError::Decoding(format!("malformed chat completion: {e}")))?;

    let mut decoder = ChunkStreamDecoder::new();
    let mut out = Vec::new();
    let choice = response.choices.into_iter().next();
    let choices = choice
        .map(|choice| {
            let message = choice.message;
            let tool_calls = message
                .tool_calls
                .into_iter()
                .zip(0u32..)
                .map(|(call, index)| OpenAiStreamToolCall {
                    index,
                    id: Some(call.id),
                    function: Some(OpenAiStreamToolCallFunction {
                        name: Some(call.function.name),
                        arguments: Some(call.function.arguments),
                    }),
                    extra_content: call.extra_content,
                })
                .collect();
            vec![OpenAiStreamChoice {
                index: choice.index,
                delta: OpenAiDelta {
                    content: message.content.map(|content| content.joined_text()),
                    reasoning_content: message.reasoning_content,
                    reasoning: None,
                    refusal: message.refusal,
                    tool_calls,
                },
                // an absent finish reason still ends the turn normally
                finish_reason: Some(choice.finish_reason.unwrap_or_else(|| "stop".to_string())),
            }]
        })
        .unwrap_or_default();

    decoder.handle_chunk(
        OpenAiStreamChunk {
            id: Some(response.id),
            choices,
            usage: response.usage,
            service_tier: response.service_tier,
            error: None,
        },
        &mut out,
    );
    decoder.finish(&mut out);
    Ok(out)
}
