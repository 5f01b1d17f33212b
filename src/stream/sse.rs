//! Server-sent events demultiplexer.
//!
//! Splits an upstream byte stream into [`RawEvent`] frames following the
//! [event-stream field rules](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;
use std::collections::VecDeque;

use super::RawEvent;
use crate::error::EngineError;

/// Incremental SSE line parser.
///
/// Text may arrive split at arbitrary boundaries; complete frames are
/// appended to the caller's buffer once their blank-line terminator arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data: String,
    has_data: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn feed(&mut self, chunk: &str) -> Vec<RawEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<RawEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data,
                &mut self.has_data,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
        } else if self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024 {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush a trailing frame whose blank-line terminator never arrived.
    pub fn finish(&mut self, out: &mut Vec<RawEvent>) {
        if self.read_offset < self.buffer.len() {
            let tail = self.buffer[self.read_offset..].to_string();
            let tail = tail.strip_suffix('\r').unwrap_or(&tail);
            Self::process_line(
                tail,
                &mut self.event_type,
                &mut self.data,
                &mut self.has_data,
                out,
            );
        }
        self.buffer.clear();
        self.read_offset = 0;
        Self::process_line(
            "",
            &mut self.event_type,
            &mut self.data,
            &mut self.has_data,
            out,
        );
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data: &mut String,
        has_data: &mut bool,
        out: &mut Vec<RawEvent>,
    ) {
        if line.is_empty() {
            if *has_data {
                out.push(RawEvent {
                    event: event_type.take(),
                    data: std::mem::take(data),
                });
                *has_data = false;
            } else {
                *event_type = None;
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data.push('\n');
            } else {
                *has_data = true;
            }
            data.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        }
        // id, retry and unknown fields carry nothing the decoders use
    }
}

struct DemuxState<S> {
    source: std::pin::Pin<Box<S>>,
    parser: SseParser,
    remainder: Vec<u8>,
    pending: VecDeque<RawEvent>,
    parsed: Vec<RawEvent>,
    done: bool,
}

impl<S> DemuxState<S> {
    /// Decode as much UTF-8 as possible, carrying an incomplete trailing
    /// sequence over to the next chunk.
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.remainder.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.remainder) {
            Ok(text) => {
                self.parser.feed_into(text, &mut self.parsed);
                self.remainder.len()
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(text) = std::str::from_utf8(&self.remainder[..valid_up_to]) {
                    self.parser.feed_into(text, &mut self.parsed);
                }
                match err.error_len() {
                    // a broken sequence mid-chunk will never become valid
                    Some(bad_len) => {
                        self.parser.feed_into("\u{FFFD}", &mut self.parsed);
                        valid_up_to + bad_len
                    }
                    None => valid_up_to,
                }
            }
        };
        self.remainder.drain(..valid_up_to);
        self.pending.extend(self.parsed.drain(..));
    }

    fn close(&mut self) {
        if !self.remainder.is_empty() {
            let tail = String::from_utf8_lossy(&self.remainder).into_owned();
            self.parser.feed_into(&tail, &mut self.parsed);
            self.remainder.clear();
        }
        self.parser.finish(&mut self.parsed);
        self.pending.extend(self.parsed.drain(..));
        self.done = true;
    }
}

/// Split an HTTP body into raw events.
///
/// A body error surfaces as one `Err(EngineError::Transport)` item, after
/// which the stream ends.
pub fn sse_event_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<RawEvent, EngineError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = DemuxState {
        source: Box::pin(byte_stream),
        parser: SseParser::new(),
        remainder: Vec::new(),
        pending: VecDeque::with_capacity(8),
        parsed: Vec::with_capacity(8),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.source.as_mut().next().await {
                Some(Ok(bytes)) => state.push_bytes(&bytes),
                Some(Err(err)) => {
                    state.done = true;
                    state.pending.clear();
                    return Some((
                        Err(EngineError::Transport(format!("response body error: {err}"))),
                        state,
                    ));
                }
                None => state.close(),
            }
        }
    })
}
