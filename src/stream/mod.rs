pub mod sse;
pub mod tool_calls;
pub mod usage;

pub use sse::{sse_event_stream, SseParser};
pub use tool_calls::ToolCallAccumulator;
pub use usage::UsageAccumulator;

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use memchr::memmem;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::protocol::anthropic::stream::BlockStreamDecoder;
use crate::protocol::canonical::{Dialect, StopReason, StreamEvent};
use crate::protocol::openai_chat::stream::ChunkStreamDecoder;
use crate::protocol::openai_responses::stream::ItemStreamDecoder;

/// One demultiplexed upstream event: an optional event name and its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub event: Option<String>,
    pub data: String,
}

impl RawEvent {
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    #[must_use]
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, EngineError>> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Incremental translation of one dialect's raw events into canonical events.
///
/// A decoder is built fresh for every turn. Once it reports
/// [`StreamDecoder::is_finished`], further input is ignored.
pub trait StreamDecoder: Send {
    fn decode_into(&mut self, raw: &RawEvent, out: &mut Vec<StreamEvent>);

    fn decode(&mut self, raw: &RawEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.decode_into(raw, &mut out);
        out
    }

    fn is_finished(&self) -> bool;

    /// Called once the transport closes. Ends the turn with `MessageEnd` when a
    /// stop was already announced, otherwise with a transport error.
    fn finish(&mut self, out: &mut Vec<StreamEvent>);
}

#[must_use]
pub fn decoder_for(dialect: Dialect) -> Box<dyn StreamDecoder> {
    match dialect {
        Dialect::IndexedBlocks => Box::new(BlockStreamDecoder::new()),
        Dialect::OutputItems => Box::new(ItemStreamDecoder::new()),
        Dialect::ChatChunks => Box::new(ChunkStreamDecoder::new()),
    }
}

/// Run a whole recorded sequence through a decoder, closing it at the end.
pub fn decode_all<'a, I>(decoder: &mut dyn StreamDecoder, raws: I) -> Vec<StreamEvent>
where
    I: IntoIterator<Item = &'a RawEvent>,
{
    let mut out = Vec::new();
    for raw in raws {
        if decoder.is_finished() {
            break;
        }
        decoder.decode_into(raw, &mut out);
    }
    if !decoder.is_finished() {
        decoder.finish(&mut out);
    }
    out
}

/// Terminal bookkeeping shared by every dialect decoder.
#[derive(Debug, Default)]
pub(crate) struct TurnState {
    pub usage: UsageAccumulator,
    pub stop_reason: Option<StopReason>,
    finished: bool,
}

impl TurnState {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn end(&mut self, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;
        out.push(StreamEvent::MessageEnd {
            usage: self.usage.finalize(),
            stop_reason: self.stop_reason,
        });
    }

    pub fn fail(&mut self, error: EngineError, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;
        out.push(StreamEvent::Error(error));
    }

    /// End of input without a terminal event from the provider.
    pub fn close(&mut self, out: &mut Vec<StreamEvent>) {
        if self.stop_reason.is_some() {
            self.end(out);
        } else {
            self.fail(
                EngineError::Transport("stream closed before the turn completed".to_string()),
                out,
            );
        }
    }
}

/// Best-effort lookup of a payload's `"type"` string, tolerant of truncated
/// or otherwise malformed JSON.
pub(crate) fn probe_event_type(data: &str) -> Option<&str> {
    let bytes = data.as_bytes();
    let key_end = memmem::find(bytes, b"\"type\"")? + 6;
    let rest = data[key_end..].trim_start().strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = memchr::memchr(b'"', rest.as_bytes())?;
    Some(&rest[..end])
}

/// The event name a frame announces, preferring the SSE `event:` field.
pub(crate) fn raw_event_type(raw: &RawEvent) -> Option<&str> {
    raw.event
        .as_deref()
        .filter(|name| !name.is_empty())
        .or_else(|| probe_event_type(&raw.data))
}

struct DriveState {
    raw: RawEventStream,
    decoder: Box<dyn StreamDecoder>,
    cancel: CancellationToken,
    pending: VecDeque<StreamEvent>,
    scratch: Vec<StreamEvent>,
    done: bool,
}

/// Drive a decoder over a raw event stream.
///
/// The returned stream ends right after the terminal event. Cancelling the
/// token ends it immediately without a terminal item; dropping the stream
/// drops the upstream as well.
pub fn decode_event_stream(
    raw: RawEventStream,
    decoder: Box<dyn StreamDecoder>,
    cancel: CancellationToken,
) -> EventStream {
    let state = DriveState {
        raw,
        decoder,
        cancel,
        pending: VecDeque::with_capacity(8),
        scratch: Vec::with_capacity(8),
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() {
                tracing::debug!("turn cancelled by caller");
                return None;
            }
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.done {
                return None;
            }

            let next = tokio::select! {
                biased;
                () = state.cancel.cancelled() => {
                    tracing::debug!("turn cancelled by caller");
                    return None;
                }
                next = state.raw.next() => next,
            };

            match next {
                Some(Ok(raw)) => {
                    state.decoder.decode_into(&raw, &mut state.scratch);
                    if state.decoder.is_finished() {
                        state.done = true;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "upstream stream failed mid-turn");
                    if !state.decoder.is_finished() {
                        state.scratch.push(StreamEvent::Error(err));
                    }
                    state.done = true;
                }
                None => {
                    if !state.decoder.is_finished() {
                        state.decoder.finish(&mut state.scratch);
                    }
                    state.done = true;
                }
            }
            state.pending.extend(state.scratch.drain(..));
        }
    }))
}
