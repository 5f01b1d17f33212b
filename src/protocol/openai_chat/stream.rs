use crate::error::EngineError;
use crate::protocol::canonical::{PartialUsage, StopReason, StreamEvent};
use crate::protocol::openai_chat::{stop_reason_from_wire, thought_signature, OpenAiStreamChunk};
use crate::stream::{RawEvent, StreamDecoder, ToolCallAccumulator, TurnState};
use crate::util::truncate_for_log;

/// Decoder for delta-merged chat chunks.
///
/// Tool-call deltas are addressed by a chunk-local integer index; an entry
/// starts only once both its id and name have been seen.
#[derive(Debug, Default)]
pub struct ChunkStreamDecoder {
    started: bool,
    tools: ToolCallAccumulator<u32>,
    refused: bool,
    turn: TurnState,
}

impl ChunkStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle_chunk(&mut self, chunk: OpenAiStreamChunk, out: &mut Vec<StreamEvent>) {
        if let Some(error) = chunk.error {
            self.turn
                .fail(EngineError::provider(error.code_string(), error.message), out);
            return;
        }
        if !self.started {
            if let Some(id) = chunk.id.filter(|id| !id.is_empty()) {
                self.started = true;
                out.push(StreamEvent::MessageStart { id });
            }
        }
        if let Some(usage) = &chunk.usage {
            self.turn.usage.merge(usage.to_partial());
        }
        if chunk.service_tier.is_some() {
            self.turn.usage.merge(PartialUsage {
                service_tier: chunk.service_tier,
                ..PartialUsage::default()
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
            if !reasoning.is_empty() {
                out.push(StreamEvent::thinking(reasoning));
            }
        }
        if let Some(content) = delta.content.filter(|text| !text.is_empty()) {
            out.push(StreamEvent::text(content));
        }
        if let Some(refusal) = delta.refusal.filter(|text| !text.is_empty()) {
            self.refused = true;
            out.push(StreamEvent::text(refusal));
        }
        for call in delta.tool_calls {
            let (name, arguments) = match &call.function {
                Some(function) => (function.name.as_deref(), function.arguments.as_deref()),
                None => (None, None),
            };
            self.tools
                .stage(call.index, call.id.as_deref(), name, arguments, out);
            if let Some(signature) = thought_signature(call.extra_content.as_ref()) {
                self.tools.attach_signature(&call.index, signature);
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            let stop = stop_reason_from_wire(reason);
            if stop == StopReason::ContentFilter {
                self.refused = true;
            }
            self.turn.stop_reason = Some(stop);
            self.tools.finish_all(out);
        }
    }

    /// `[DONE]`, or the transport closing after a finish reason.
    fn end_turn(&mut self, out: &mut Vec<StreamEvent>) {
        self.tools.finish_all(out);
        if self.refused {
            self.turn.stop_reason = Some(StopReason::ContentFilter);
        }
        self.turn.end(out);
        if self.refused {
            out.push(StreamEvent::Error(EngineError::ContentFiltered(
                "the provider refused to continue this response".to_string(),
            )));
        }
    }
}

impl StreamDecoder for ChunkStreamDecoder {
    fn decode_into(&mut self, raw: &RawEvent, out: &mut Vec<StreamEvent>) {
        if self.turn.is_finished() {
            return;
        }
        let data = raw.data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.end_turn(out);
            return;
        }
        match serde_json::from_str::<OpenAiStreamChunk>(data) {
            Ok(chunk) => self.handle_chunk(chunk, out),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    data = truncate_for_log(data, 200),
                    "skipping undecodable chat chunk"
                );
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.turn.is_finished()
    }

    fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        if self.turn.is_finished() {
            return;
        }
        if self.turn.stop_reason.is_some() {
            self.end_turn(out);
        } else {
            self.turn.close(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{Signature, Usage};
    use serde_json::{json, Value};

    fn feed(decoder: &mut ChunkStreamDecoder, chunk: Value) -> Vec<StreamEvent> {
        decoder.decode(&RawEvent::data(chunk.to_string()))
    }

    #[test]
    fn test_id_and_name_split_across_chunks() {
        let mut decoder = ChunkStreamDecoder::new();
        let first = feed(
            &mut decoder,
            json!({"id": "c1", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_a", "function": {"arguments": "{\"x\""}}]}}]}),
        );
        assert_eq!(first, vec![StreamEvent::MessageStart { id: "c1".to_string() }]);
        let second = feed(
            &mut decoder,
            json!({"id": "c1", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"name": "calc", "arguments": ":2}"}}]}}]}),
        );
        assert!(matches!(&second[0], StreamEvent::ToolCallStart(call) if call.id == "call_a" && call.name == "calc"));
        assert!(matches!(&second[1], StreamEvent::ToolCallDelta { fragment, .. } if fragment == "{\"x\":2}"));

        let finished = feed(
            &mut decoder,
            json!({"id": "c1", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        );
        assert!(matches!(&finished[..], [StreamEvent::ToolCallEnd(call)] if call.arguments.get("x") == Some(&json!(2))));

        let usage = feed(
            &mut decoder,
            json!({"id": "c1", "choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 3, "prompt_tokens_details": {"cached_tokens": 1}}}),
        );
        assert!(usage.is_empty());
        let done = decoder.decode(&RawEvent::data("[DONE]"));
        assert_eq!(
            done,
            vec![StreamEvent::MessageEnd {
                usage: Some(Usage {
                    input_tokens: 9,
                    output_tokens: 3,
                    cached_tokens: Some(1),
                    ..Usage::default()
                }),
                stop_reason: Some(StopReason::ToolCalls),
            }]
        );
    }

    #[test]
    fn test_reasoning_and_content() {
        let mut decoder = ChunkStreamDecoder::new();
        let events = feed(
            &mut decoder,
            json!({"id": "c2", "choices": [{"index": 0, "delta": {"reasoning_content": "think", "content": "say"}}]}),
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::MessageStart { id: "c2".to_string() },
                StreamEvent::thinking("think"),
                StreamEvent::text("say"),
            ]
        );
    }

    #[test]
    fn test_garbage_is_skipped() {
        let mut decoder = ChunkStreamDecoder::new();
        assert!(decoder.decode(&RawEvent::data("{not json")).is_empty());
        assert!(!decoder.is_finished());
    }

    #[test]
    fn test_top_level_error_is_terminal() {
        let mut decoder = ChunkStreamDecoder::new();
        let events = feed(
            &mut decoder,
            json!({"error": {"message": "quota exceeded", "type": "insufficient_quota", "code": "insufficient_quota"}}),
        );
        assert_eq!(
            events,
            vec![StreamEvent::Error(EngineError::provider(
                "insufficient_quota",
                "quota exceeded"
            ))]
        );
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_thought_signature_attached_to_call() {
        let mut decoder = ChunkStreamDecoder::new();
        feed(
            &mut decoder,
            json!({"id": "c3", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_g", "function": {"name": "lookup", "arguments": "{}"}, "extra_content": {"google": {"thought_signature": "sig=="}}}]}}]}),
        );
        let events = feed(
            &mut decoder,
            json!({"id": "c3", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        );
        assert!(matches!(&events[..], [StreamEvent::ToolCallEnd(call)] if call.signature == Some(Signature::new("sig=="))));
    }

    #[test]
    fn test_content_filter_finish() {
        let mut decoder = ChunkStreamDecoder::new();
        feed(
            &mut decoder,
            json!({"id": "c4", "choices": [{"index": 0, "delta": {}, "finish_reason": "content_filter"}]}),
        );
        let mut out = Vec::new();
        decoder.finish(&mut out);
        assert!(matches!(
            &out[..],
            [
                StreamEvent::MessageEnd { stop_reason: Some(StopReason::ContentFilter), .. },
                StreamEvent::Error(EngineError::ContentFiltered(_))
            ]
        ));
    }
}
