use crate::error::EngineError;
use crate::protocol::canonical::StreamEvent;
use crate::protocol::openai_responses::stream::ItemStreamDecoder;
use crate::protocol::openai_responses::{ResponsesEnvelope, ResponsesStreamEvent};

/// Replay a complete (non-streaming) Responses object as canonical events.
///
/// Items are fed through the streaming decoder as if each had been announced
/// done, so both delivery modes share one interpretation of the output.
///
/// # Errors
///
/// Returns [`EngineError::Decoding`] when the body is not a response object.
pub fn decode_responses_response(body: &str) -> Result<Vec<StreamEvent>, EngineError> {
    let mut response: ResponsesEnvelope = serde_json::from_str(body)
        .map_err(|e| EngineError::Decoding(format!("malformed responses object: {e}")))?;

    let mut decoder = ItemStreamDecoder::new();
    let mut out = Vec::new();
    let items = std::mem::take(&mut response.output);
    decoder.handle(
        ResponsesStreamEvent::Created {
            response: ResponsesEnvelope {
                usage: None,
                ..response.clone()
            },
        },
        &mut out,
    );
    for item in items {
        decoder.handle(ResponsesStreamEvent::OutputItemDone { item }, &mut out);
    }
    let terminal = match response.status.as_deref() {
        Some("incomplete") => ResponsesStreamEvent::Incomplete { response },
        Some("failed") => ResponsesStreamEvent::Failed { response },
        Some("cancelled" | "canceled") => ResponsesStreamEvent::Canceled {
            response: Some(response),
        },
        _ => ResponsesStreamEvent::Completed { response },
    };
    decoder.handle(terminal, &mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{StopReason, Usage};
    use serde_json::json;

    #[test]
    fn test_replay_message_and_function_call() {
        let body = json!({
            "id": "resp_1",
            "object": "response",
            "status": "completed",
            "output": [
                {"type": "message", "id": "msg_1", "role": "assistant", "content": [{"type": "output_text", "text": "Let me check.", "annotations": []}]},
                {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "weather", "arguments": "{\"city\":\"Oslo\"}"}
            ],
            "usage": {"input_tokens": 11, "output_tokens": 4, "input_tokens_details": {"cached_tokens": 0}}
        });
        let events = decode_responses_response(&body.to_string()).expect("events");
        assert_eq!(events[0], StreamEvent::MessageStart { id: "resp_1".to_string() });
        assert_eq!(events[1], StreamEvent::text("Let me check."));
        assert!(matches!(&events[2], StreamEvent::ToolCallStart(call) if call.id == "call_1"));
        assert!(matches!(&events[4], StreamEvent::ToolCallEnd(call) if call.arguments.get("city") == Some(&json!("Oslo"))));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::MessageEnd {
                usage: Some(Usage {
                    input_tokens: 11,
                    output_tokens: 4,
                    cached_tokens: Some(0),
                    ..Usage::default()
                }),
                stop_reason: Some(StopReason::ToolCalls),
            })
        );
    }

    #[test]
    fn test_failed_status_is_provider_error() {
        let body = json!({
            "id": "resp_2",
            "status": "failed",
            "output": [],
            "error": {"code": "rate_limit_exceeded", "message": "slow down"}
        });
        let events = decode_responses_response(&body.to_string()).expect("events");
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Error(EngineError::provider(
                "rate_limit_exceeded",
                "slow down"
            )))
        );
    }
}
