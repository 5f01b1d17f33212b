use serde_json::Value;
use smallvec::SmallVec;

use crate::error::EngineError;
use crate::protocol::anthropic::{
    search_query, search_result_activity, stop_reason_from_wire, AnthropicContentBlock,
    AnthropicDelta, AnthropicStreamEvent,
};
use crate::protocol::canonical::{
    RedactedBlob, SearchActivity, SearchStatus, Signature, StopReason, StreamEvent, ThinkingDelta,
};
use crate::stream::{raw_event_type, RawEvent, StreamDecoder, ToolCallAccumulator, TurnState};
use crate::util::truncate_for_log;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    RedactedThinking,
    ToolUse,
    WebSearch,
    SearchResult,
    Other,
}

#[derive(Debug)]
struct PendingSearch {
    index: usize,
    id: String,
    input: String,
    query: Option<String>,
}

/// Decoder for index-addressed content blocks (`content_block_start`,
/// `content_block_delta`, `content_block_stop`).
///
/// Blocks are sequential: one block is open at a time and its kind decides
/// how deltas and the closing event are interpreted.
#[derive(Debug, Default)]
pub struct BlockStreamDecoder {
    current_block_index: Option<usize>,
    current_block_kind: Option<BlockKind>,
    thinking_signature: Option<Signature>,
    tools: ToolCallAccumulator<usize>,
    searches: SmallVec<[PendingSearch; 1]>,
    refused: bool,
    turn: TurnState,
}

impl BlockStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self, event: AnthropicStreamEvent, out: &mut Vec<StreamEvent>) {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                out.push(StreamEvent::MessageStart { id: message.id });
                if let Some(usage) = message.usage {
                    self.turn.usage.merge(usage.to_partial());
                }
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.open_block(index, content_block, out),
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                self.block_delta(index, delta, out);
            }
            AnthropicStreamEvent::ContentBlockStop { index } => self.close_block(index, out),
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    let stop = stop_reason_from_wire(reason);
                    if stop.is_none() {
                        tracing::debug!(reason, "unrecognised stop reason");
                    }
                    self.refused = stop == Some(StopReason::ContentFilter);
                    self.turn.stop_reason = stop.or(Some(StopReason::EndOfTurn));
                }
                if let Some(usage) = usage {
                    self.turn.usage.merge(usage.to_partial());
                }
            }
            AnthropicStreamEvent::MessageStop => self.end_turn(out),
            AnthropicStreamEvent::Ping => {}
            AnthropicStreamEvent::Error { error } => {
                self.turn
                    .fail(EngineError::provider(error.kind, error.message), out);
            }
        }
    }

    fn open_block(&mut self, index: usize, block: AnthropicContentBlock, out: &mut Vec<StreamEvent>) {
        if let Some(open) = self.current_block_index.filter(|open| *open != index) {
            tracing::debug!(open, index, "block opened before previous block closed");
            self.close_block(open, out);
        }
        let kind = match block {
            AnthropicContentBlock::Text { text } => {
                if !text.is_empty() {
                    out.push(StreamEvent::text(text));
                }
                BlockKind::Text
            }
            AnthropicContentBlock::Thinking {
                thinking,
                signature,
            } => {
                self.thinking_signature = signature.filter(|sig| !sig.is_empty()).map(Signature::new);
                if !thinking.is_empty() {
                    out.push(StreamEvent::thinking(thinking));
                }
                BlockKind::Thinking
            }
            AnthropicContentBlock::RedactedThinking { data } => {
                out.push(StreamEvent::ThinkingDelta(ThinkingDelta::Redacted(
                    RedactedBlob::new(data),
                )));
                BlockKind::RedactedThinking
            }
            AnthropicContentBlock::ToolUse { id, name, input } => {
                self.tools.start(index, &id, &name, out);
                // input is normally `{}` here and streamed later; a pre-filled
                // object is forwarded as the first fragment
                if let Value::Object(map) = &input {
                    if !map.is_empty() {
                        self.tools.append(&index, &input.to_string(), out);
                    }
                }
                BlockKind::ToolUse
            }
            AnthropicContentBlock::ServerToolUse { id, name, input } if name == "web_search" => {
                out.push(StreamEvent::SearchActivity(SearchActivity::new(
                    id.clone(),
                    SearchStatus::InProgress,
                )));
                self.searches.push(PendingSearch {
                    index,
                    id,
                    input: String::new(),
                    query: search_query(&input),
                });
                BlockKind::WebSearch
            }
            AnthropicContentBlock::WebSearchToolResult {
                tool_use_id,
                content,
            } => {
                let mut activity = search_result_activity(&tool_use_id, &content);
                if let Some(pos) = self.searches.iter().position(|s| s.id == tool_use_id) {
                    activity.query = self.searches.remove(pos).query;
                }
                out.push(StreamEvent::SearchActivity(activity));
                BlockKind::SearchResult
            }
            _ => BlockKind::Other,
        };
        self.current_block_index = Some(index);
        self.current_block_kind = Some(kind);
    }

    fn block_delta(&mut self, index: usize, delta: AnthropicDelta, out: &mut Vec<StreamEvent>) {
        match delta {
            AnthropicDelta::TextDelta { text } => {
                if !text.is_empty() {
                    out.push(StreamEvent::text(text));
                }
            }
            AnthropicDelta::ThinkingDelta { thinking } => {
                if !thinking.is_empty() {
                    out.push(StreamEvent::thinking(thinking));
                }
            }
            AnthropicDelta::SignatureDelta { signature } => match &mut self.thinking_signature {
                Some(existing) => existing.push_fragment(&signature),
                None => self.thinking_signature = Some(Signature::new(signature)),
            },
            AnthropicDelta::InputJsonDelta { partial_json } => {
                if self.current_block_kind == Some(BlockKind::WebSearch) {
                    if let Some(search) = self.searches.iter_mut().find(|s| s.index == index) {
                        search.input.push_str(&partial_json);
                    }
                } else {
                    self.tools.append(&index, &partial_json, out);
                }
            }
            AnthropicDelta::Unknown => {}
        }
    }

    fn close_block(&mut self, index: usize, out: &mut Vec<StreamEvent>) {
        if self.current_block_index != Some(index) {
            tracing::debug!(index, "stop for a block that is not open");
            // a tool block can still be closed by key
            self.tools.finish(&index, out);
            return;
        }
        match self.current_block_kind.take() {
            Some(BlockKind::ToolUse) => {
                self.tools.finish(&index, out);
            }
            Some(BlockKind::Thinking) => {
                if let Some(signature) = self.thinking_signature.take() {
                    out.push(StreamEvent::ThinkingDelta(ThinkingDelta::Thinking {
                        text: String::new(),
                        signature: Some(signature),
                    }));
                }
            }
            Some(BlockKind::WebSearch) => {
                if let Some(search) = self.searches.iter_mut().find(|s| s.index == index) {
                    if let Ok(input) = serde_json::from_str::<Value>(&search.input) {
                        search.query = search_query(&input).or(search.query.take());
                    }
                    let mut activity = SearchActivity::new(search.id.clone(), SearchStatus::Searching);
                    activity.query.clone_from(&search.query);
                    out.push(StreamEvent::SearchActivity(activity));
                }
            }
            Some(
                BlockKind::Text
                | BlockKind::RedactedThinking
                | BlockKind::SearchResult
                | BlockKind::Other,
            )
            | None => {}
        }
        self.current_block_index = None;
    }

    fn end_turn(&mut self, out: &mut Vec<StreamEvent>) {
        self.tools.finish_all(out);
        self.turn.end(out);
        if self.refused {
            out.push(StreamEvent::Error(EngineError::ContentFiltered(
                "the provider refused to continue this response".to_string(),
            )));
        }
    }
}

impl StreamDecoder for BlockStreamDecoder {
    fn decode_into(&mut self, raw: &RawEvent, out: &mut Vec<StreamEvent>) {
        if self.turn.is_finished() {
            return;
        }
        match serde_json::from_str::<AnthropicStreamEvent>(&raw.data) {
            Ok(event) => self.handle(event, out),
            Err(err) => match raw_event_type(raw) {
                Some(kind @ ("message_stop" | "error")) => {
                    tracing::warn!(kind, error = %err, "undecodable terminal event");
                    self.turn.fail(
                        EngineError::Decoding(format!("malformed {kind} event: {err}")),
                        out,
                    );
                }
                kind => {
                    tracing::warn!(
                        kind,
                        error = %err,
                        data = truncate_for_log(&raw.data, 200),
                        "skipping undecodable stream event"
                    );
                }
            },
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
    use serde_json::json;

    fn feed(decoder: &mut BlockStreamDecoder, payload: Value) -> Vec<StreamEvent> {
        let kind = payload["type"].as_str().unwrap_or_default().to_string();
        decoder.decode(&RawEvent::named(kind, payload.to_string()))
    }

    #[test]
    fn test_thinking_signature_is_concatenated() {
        let mut decoder = BlockStreamDecoder::new();
        feed(
            &mut decoder,
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
        );
        let first = feed(
            &mut decoder,
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
        );
        assert_eq!(first, vec![StreamEvent::thinking("hmm")]);
        feed(
            &mut decoder,
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "ab"}}),
        );
        feed(
            &mut decoder,
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "cd"}}),
        );
        let closed = feed(&mut decoder, json!({"type": "content_block_stop", "index": 0}));
        assert_eq!(
            closed,
            vec![StreamEvent::ThinkingDelta(ThinkingDelta::Thinking {
                text: String::new(),
                signature: Some(Signature::new("abcd")),
            })]
        );
    }

    #[test]
    fn test_refusal_ends_with_content_filtered() {
        let mut decoder = BlockStreamDecoder::new();
        feed(
            &mut decoder,
            json!({"type": "message_delta", "delta": {"stop_reason": "refusal"}, "usage": {"output_tokens": 2}}),
        );
        let events = feed(&mut decoder, json!({"type": "message_stop"}));
        assert!(matches!(
            &events[..],
            [
                StreamEvent::MessageEnd {
                    stop_reason: Some(StopReason::ContentFilter),
                    ..
                },
                StreamEvent::Error(EngineError::ContentFiltered(_))
            ]
        ));
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_error_event_is_terminal_provider_error() {
        let mut decoder = BlockStreamDecoder::new();
        let events = feed(
            &mut decoder,
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        );
        assert_eq!(
            events,
            vec![StreamEvent::Error(EngineError::provider(
                "overloaded_error",
                "Overloaded"
            ))]
        );
        assert!(feed(&mut decoder, json!({"type": "message_stop"})).is_empty());
    }

    #[test]
    fn test_malformed_terminal_event_is_decoding_error() {
        let mut decoder = BlockStreamDecoder::new();
        let events = decoder.decode(&RawEvent::named("message_stop", "{\"type\":\"message_st"));
        assert!(matches!(&events[..], [StreamEvent::Error(EngineError::Decoding(_))]));
    }

    #[test]
    fn test_web_search_progress() {
        let mut decoder = BlockStreamDecoder::new();
        let started = feed(
            &mut decoder,
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "server_tool_use", "id": "srv_1", "name": "web_search", "input": {}}}),
        );
        assert!(matches!(&started[..], [StreamEvent::SearchActivity(a)] if a.status == SearchStatus::InProgress));
        feed(
            &mut decoder,
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"query\":\"rust sse\"}"}}),
        );
        let searching = feed(&mut decoder, json!({"type": "content_block_stop", "index": 1}));
        assert!(matches!(&searching[..], [StreamEvent::SearchActivity(a)]
            if a.status == SearchStatus::Searching && a.query.as_deref() == Some("rust sse")));
        let done = feed(
            &mut decoder,
            json!({"type": "content_block_start", "index": 2, "content_block": {"type": "web_search_tool_result", "tool_use_id": "srv_1", "content": [{"type": "web_search_result", "url": "https://a.example", "title": "A"}]}}),
        );
        assert!(matches!(&done[..], [StreamEvent::SearchActivity(a)]
            if a.status == SearchStatus::Completed && a.sources.len() == 1 && a.query.as_deref() == Some("rust sse")));
    }

    #[test]
    fn test_close_without_stop_is_transport_error() {
        let mut decoder = BlockStreamDecoder::new();
        feed(
            &mut decoder,
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 3}}}),
        );
        let mut out = Vec::new();
        decoder.finish(&mut out);
        assert!(matches!(&out[..], [StreamEvent::Error(EngineError::Transport(_))]));
    }
}
