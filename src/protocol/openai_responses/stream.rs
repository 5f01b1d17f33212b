use smallvec::SmallVec;

use crate::error::EngineError;
use crate::protocol::canonical::{
    RedactedBlob, SearchActivity, SearchStatus, StopReason, StreamEvent, ThinkingDelta,
};
use crate::protocol::openai_responses::{
    web_search_item_activity, ResponsesContentPart, ResponsesEnvelope, ResponsesOutputItem,
    ResponsesStreamEvent, TERMINAL_EVENT_TYPES,
};
use crate::stream::{raw_event_type, RawEvent, StreamDecoder, ToolCallAccumulator, TurnState};
use crate::util::truncate_for_log;

/// Decoder for output items addressed by server-assigned ids.
///
/// Function calls are keyed by item id; the call id and name announced on
/// `response.output_item.added` are retained so argument deltas and the
/// closing events can be correlated.
#[derive(Debug, Default)]
pub struct ItemStreamDecoder {
    started: bool,
    tools: ToolCallAccumulator<String>,
    closed_calls: SmallVec<[String; 4]>,
    text_items: SmallVec<[String; 2]>,
    saw_tool_call: bool,
    refused: bool,
    turn: TurnState,
}

impl ItemStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle(&mut self, event: ResponsesStreamEvent, out: &mut Vec<StreamEvent>) {
        match event {
            ResponsesStreamEvent::Created { response }
            | ResponsesStreamEvent::InProgress { response } => {
                self.announce(&response.id, out);
                if let Some(partial) = response.partial_usage() {
                    self.turn.usage.merge(partial);
                }
            }
            ResponsesStreamEvent::OutputItemAdded { item } => self.item_added(item, out),
            ResponsesStreamEvent::OutputItemDone { item } => self.item_done(item, out),
            ResponsesStreamEvent::OutputTextDelta { item_id, delta } => {
                self.mark_text_item(item_id);
                if !delta.is_empty() {
                    out.push(StreamEvent::text(delta));
                }
            }
            ResponsesStreamEvent::RefusalDelta { item_id, delta } => {
                self.mark_text_item(item_id);
                self.refused = true;
                if !delta.is_empty() {
                    out.push(StreamEvent::text(delta));
                }
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta { delta }
            | ResponsesStreamEvent::ReasoningTextDelta { delta } => {
                if !delta.is_empty() {
                    out.push(StreamEvent::thinking(delta));
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                self.tools.append(&item_id, &delta, out);
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone { item_id, arguments } => {
                self.close_call(&item_id, &arguments, out);
            }
            ResponsesStreamEvent::WebSearchInProgress { item_id } => out.push(
                StreamEvent::SearchActivity(SearchActivity::new(item_id, SearchStatus::InProgress)),
            ),
            ResponsesStreamEvent::WebSearchSearching { item_id } => out.push(
                StreamEvent::SearchActivity(SearchActivity::new(item_id, SearchStatus::Searching)),
            ),
            ResponsesStreamEvent::WebSearchCompleted { item_id } => out.push(
                StreamEvent::SearchActivity(SearchActivity::new(item_id, SearchStatus::Completed)),
            ),
            ResponsesStreamEvent::Completed { response } => {
                self.complete(&response, None, out);
            }
            ResponsesStreamEvent::Incomplete { response } => {
                let stop = match response
                    .incomplete_details
                    .as_ref()
                    .and_then(|details| details.reason.as_deref())
                {
                    Some("max_output_tokens") => Some(StopReason::MaxTokens),
                    Some("content_filter") => {
                        self.refused = true;
                        Some(StopReason::ContentFilter)
                    }
                    _ => None,
                };
                self.complete(&response, stop, out);
            }
            ResponsesStreamEvent::Failed { response } => {
                let error = match response.error {
                    Some(body) => EngineError::provider(
                        body.code.unwrap_or_else(|| "response_failed".to_string()),
                        body.message,
                    ),
                    None => EngineError::provider("response_failed", "the response failed"),
                };
                self.turn.fail(error, out);
            }
            ResponsesStreamEvent::Canceled { .. } => self.turn.fail(EngineError::Cancelled, out),
            ResponsesStreamEvent::Error { code, message } => {
                self.turn.fail(
                    EngineError::provider(code.unwrap_or_else(|| "error".to_string()), message),
                    out,
                );
            }
            ResponsesStreamEvent::Other => {}
        }
    }

    fn announce(&mut self, id: &str, out: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart { id: id.to_string() });
        }
    }

    fn mark_text_item(&mut self, item_id: String) {
        if !item_id.is_empty() && !self.text_items.contains(&item_id) {
            self.text_items.push(item_id);
        }
    }

    fn item_added(&mut self, item: ResponsesOutputItem, out: &mut Vec<StreamEvent>) {
        match item {
            ResponsesOutputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            } => {
                self.tools.start(id.clone(), &call_id, &name, out);
                self.tools.append(&id, &arguments, out);
            }
            ResponsesOutputItem::WebSearchCall { id, .. } => out.push(StreamEvent::SearchActivity(
                SearchActivity::new(id, SearchStatus::InProgress),
            )),
            ResponsesOutputItem::Message { .. }
            | ResponsesOutputItem::Reasoning { .. }
            | ResponsesOutputItem::Unknown => {}
        }
    }

    fn item_done(&mut self, item: ResponsesOutputItem, out: &mut Vec<StreamEvent>) {
        match item {
            ResponsesOutputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            } => {
                if self.closed_calls.contains(&id) {
                    return;
                }
                if !self.tools.is_active(&id) {
                    // never announced: replay the whole call from the item
                    self.tools.start(id.clone(), &call_id, &name, out);
                }
                self.close_call(&id, &arguments, out);
            }
            ResponsesOutputItem::Message { id, content } => {
                if self.text_items.contains(&id) {
                    return;
                }
                for part in content {
                    match part {
                        ResponsesContentPart::OutputText { text } => {
                            if !text.is_empty() {
                                out.push(StreamEvent::text(text));
                            }
                        }
                        ResponsesContentPart::Refusal { refusal } => {
                            self.refused = true;
                            out.push(StreamEvent::text(refusal));
                        }
                        ResponsesContentPart::Unknown => {}
                    }
                }
            }
            ResponsesOutputItem::Reasoning {
                encrypted_content, ..
            } => {
                if let Some(blob) = encrypted_content.filter(|blob| !blob.is_empty()) {
                    out.push(StreamEvent::ThinkingDelta(ThinkingDelta::Redacted(
                        RedactedBlob::new(blob),
                    )));
                }
            }
            ResponsesOutputItem::WebSearchCall { id, status, action } => {
                out.push(StreamEvent::SearchActivity(web_search_item_activity(
                    &id,
                    status.as_deref(),
                    action.as_ref(),
                )));
            }
            ResponsesOutputItem::Unknown => {}
        }
    }

    fn close_call(&mut self, item_id: &str, arguments: &str, out: &mut Vec<StreamEvent>) {
        let key = item_id.to_string();
        if !self.tools.is_active(&key) {
            return;
        }
        if self.tools.finish_with(&key, arguments, out) {
            self.saw_tool_call = true;
        }
        self.closed_calls.push(key);
    }

    fn complete(
        &mut self,
        response: &ResponsesEnvelope,
        stop: Option<StopReason>,
        out: &mut Vec<StreamEvent>,
    ) {
        self.announce(&response.id, out);
        let before = out.len();
        self.tools.finish_all(out);
        if out[before..]
            .iter()
            .any(|event| matches!(event, StreamEvent::ToolCallEnd(_)))
        {
            self.saw_tool_call = true;
        }
        if let Some(partial) = response.partial_usage() {
            self.turn.usage.merge(partial);
        }
        self.turn.stop_reason = Some(stop.unwrap_or(if self.refused {
            StopReason::ContentFilter
        } else if self.saw_tool_call {
            StopReason::ToolCalls
        } else {
            StopReason::EndOfTurn
        }));
        self.turn.end(out);
        if self.refused {
            out.push(StreamEvent::Error(EngineError::ContentFiltered(
                "the provider refused to continue this response".to_string(),
            )));
        }
    }
}

impl StreamDecoder for ItemStreamDecoder {
    fn decode_into(&mut self, raw: &RawEvent, out: &mut Vec<StreamEvent>) {
        if self.turn.is_finished() {
            return;
        }
        match serde_json::from_str::<ResponsesStreamEvent>(&raw.data) {
            Ok(event) => self.handle(event, out),
            Err(err) => {
                let kind = raw_event_type(raw);
                if kind.is_some_and(|kind| TERMINAL_EVENT_TYPES.contains(&kind)) {
                    tracing::warn!(kind, error = %err, "undecodable terminal event");
                    self.turn.fail(
                        EngineError::Decoding(format!(
                            "malformed {} event: {err}",
                            kind.unwrap_or_default()
                        )),
                        out,
                    );
                } else {
                    tracing::warn!(
                        kind,
                        error = %err,
                        data = truncate_for_log(&raw.data, 200),
                        "skipping undecodable stream event"
                    );
                }
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
            self.tools.finish_all(out);
        }
        self.turn.close(out);
    }
}
