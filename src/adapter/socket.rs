use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::adapter::{build_wire_body, TurnRequest};
use crate::error::EngineError;
use crate::protocol::canonical::{ProviderKind, StreamEvent};
use crate::protocol::openai_responses::{ResponsesStreamEvent, TERMINAL_EVENT_TYPES};
use crate::stream::{
    decode_event_stream, decoder_for, raw_event_type, EventStream, RawEvent, RawEventStream,
};

/// Outbound half of a frame-oriented connection (e.g. a split WebSocket).
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> Result<(), EngineError>;
}

/// Inbound half of a frame-oriented connection. `None` means closed.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<String, EngineError>>;
}

#[async_trait]
impl FrameSink for tokio::sync::mpsc::Sender<String> {
    async fn send_frame(&mut self, frame: String) -> Result<(), EngineError> {
        self.send(frame)
            .await
            .map_err(|_| EngineError::Transport("connection closed".to_string()))
    }
}

#[async_trait]
impl FrameSource for tokio::sync::mpsc::Receiver<String> {
    async fn next_frame(&mut self) -> Option<Result<String, EngineError>> {
        self.recv().await.map(Ok)
    }
}

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>;
type SharedSource = Arc<tokio::sync::Mutex<Box<dyn FrameSource>>>;
type Slot = Arc<Mutex<SlotState>>;

#[derive(Debug, Default)]
struct SlotState {
    in_flight: Option<InFlight>,
    /// A released turn whose response has not reached its terminal frame yet.
    stale: Option<StaleResponse>,
}

#[derive(Debug)]
struct InFlight {
    turn: u64,
    response_id: Option<String>,
    /// `response.create` was sent and no terminal frame has been read since.
    open: bool,
}

#[derive(Debug)]
struct StaleResponse {
    turn: u64,
    response_id: Option<String>,
    cancel_sent: bool,
}

/// Frees the in-flight slot when dropped, unless another turn owns it by then.
struct SlotRelease {
    slot: Slot,
    turn: u64,
}

impl SlotRelease {
    fn record_response_id(&self, id: &str) {
        let mut state = self.slot.lock();
        if let Some(in_flight) = state.in_flight.as_mut().filter(|f| f.turn == self.turn) {
            in_flight.response_id = Some(id.to_string());
        }
    }
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        release_slot(&self.slot, self.turn, false);
    }
}

fn release_slot(slot: &Slot, turn: u64, cancel_sent: bool) {
    let mut state = slot.lock();
    if !state.in_flight.as_ref().is_some_and(|f| f.turn == turn) {
        return;
    }
    if let Some(in_flight) = state.in_flight.take().filter(|f| f.open) {
        state.stale = Some(StaleResponse {
            turn,
            response_id: in_flight.response_id,
            cancel_sent,
        });
    }
}

fn mark_open(slot: &Slot, turn: u64, open: bool) {
    if let Some(in_flight) = slot.lock().in_flight.as_mut().filter(|f| f.turn == turn) {
        in_flight.open = open;
    }
}

fn is_terminal_frame(raw: &RawEvent) -> bool {
    raw_event_type(raw).is_some_and(|kind| TERMINAL_EVENT_TYPES.contains(&kind))
}

/// A long-lived connection speaking the output-item dialect, one turn at a
/// time.
pub struct PersistentConnection {
    sink: SharedSink,
    source: SharedSource,
    slot: Slot,
    next_turn: AtomicU64,
}

impl PersistentConnection {
    #[must_use]
    pub fn new(sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            source: Arc::new(tokio::sync::Mutex::new(source)),
            slot: Arc::new(Mutex::new(SlotState::default())),
            next_turn: AtomicU64::new(1),
        }
    }

    /// Whether a turn currently holds the connection.
    ///
    /// A cancelled or abandoned turn stops holding it right away; the rest of
    /// its response is drained by the next [`start_turn`](Self::start_turn).
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.slot.lock().in_flight.is_some()
    }

    /// Send a `response.create` frame and stream the turn's events.
    ///
    /// Frames left over from a cancelled or dropped turn are consumed first,
    /// up to that response's terminal frame, so they never reach this turn.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] while another turn is in flight
    /// or when the history fails preflight, and [`EngineError::Transport`]
    /// when a frame cannot be exchanged.
    pub async fn start_turn(&self, request: TurnRequest<'_>) -> Result<TurnHandle, EngineError> {
        let frame = create_frame(build_wire_body(ProviderKind::OpenAiResponses, &request, 0)?)?;
        let turn = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let stale = {
            let mut state = self.slot.lock();
            if state.in_flight.is_some() {
                return Err(EngineError::InvalidRequest(
                    "a turn is already in flight on this connection".to_string(),
                ));
            }
            state.in_flight = Some(InFlight {
                turn,
                response_id: None,
                open: false,
            });
            state.stale.take()
        };
        let release = SlotRelease {
            slot: self.slot.clone(),
            turn,
        };

        if let Some(stale) = stale {
            self.drain_stale(stale).await?;
        }
        self.sink.lock().await.send_frame(frame).await?;
        mark_open(&self.slot, turn, true);
        tracing::debug!(turn, model = request.model, "persistent turn started");

        let cancel = request.cancel.clone();
        let decoded = decode_event_stream(
            frame_stream(self.source.clone(), self.slot.clone(), turn),
            decoder_for(ProviderKind::OpenAiResponses.dialect()),
            cancel.clone(),
        );
        let events: EventStream = Box::pin(futures_util::stream::unfold(
            (decoded, Some(release)),
            |(mut inner, mut release)| async move {
                let event = inner.next().await?;
                if let (StreamEvent::MessageStart { id }, Some(release)) = (&event, &release) {
                    release.record_response_id(id);
                }
                if event.is_terminal() {
                    release.take();
                }
                Some((event, (inner, release)))
            },
        ));

        Ok(TurnHandle {
            events,
            sink: self.sink.clone(),
            slot: self.slot.clone(),
            turn,
            cancel,
        })
    }

    /// Read and discard an abandoned response up to its terminal frame,
    /// cancelling it on the server once its id shows up.
    async fn drain_stale(&self, mut stale: StaleResponse) -> Result<(), EngineError> {
        let mut source = self.source.lock().await;
        let mut discarded = 0usize;
        loop {
            if !stale.cancel_sent {
                if let Some(response_id) = &stale.response_id {
                    self.sink
                        .lock()
                        .await
                        .send_frame(cancel_frame(response_id))
                        .await?;
                    stale.cancel_sent = true;
                }
            }
            let Some(frame) = source.next_frame().await else {
                tracing::debug!(turn = stale.turn, discarded, "connection closed while draining");
                return Ok(());
            };
            let raw = RawEvent::data(frame?);
            if is_terminal_frame(&raw) {
                tracing::debug!(turn = stale.turn, discarded, "abandoned response drained");
                return Ok(());
            }
            if stale.response_id.is_none() {
                if let Ok(ResponsesStreamEvent::Created { response }) =
                    serde_json::from_str::<ResponsesStreamEvent>(&raw.data)
                {
                    stale.response_id = Some(response.id);
                }
            }
            discarded += 1;
        }
    }
}

fn cancel_frame(response_id: &str) -> String {
    json!({"type": "response.cancel", "response_id": response_id}).to_string()
}

/// Turn the Responses request body into a `response.create` frame.
fn create_frame(body: Value) -> Result<String, EngineError> {
    let Value::Object(mut map) = body else {
        return Err(EngineError::InvalidRequest(
            "request did not serialize to a JSON object".to_string(),
        ));
    };
    map.remove("stream");
    map.insert("type".to_string(), Value::String("response.create".to_string()));
    serde_json::to_string(&map)
        .map_err(|e| EngineError::InvalidRequest(format!("request frame: {e}")))
}

/// Inbound frames as raw events; the source lock is held per frame only.
/// Reading the terminal frame closes the turn's response.
fn frame_stream(source: SharedSource, slot: Slot, turn: u64) -> RawEventStream {
    Box::pin(futures_util::stream::unfold(
        (source, slot),
        move |(source, slot)| async move {
            let frame = source.lock().await.next_frame().await?;
            let raw = frame.map(RawEvent::data);
            if raw.as_ref().is_ok_and(is_terminal_frame) {
                mark_open(&slot, turn, false);
            }
            Some((raw, (source, slot)))
        },
    ))
}

/// Events of one in-flight turn. Dropping it frees the connection.
pub struct TurnHandle {
    events: EventStream,
    sink: SharedSink,
    slot: Slot,
    turn: u64,
    cancel: CancellationToken,
}

impl TurnHandle {
    /// Ask the server to stop the response, then end the local stream.
    ///
    /// The explicit `response.cancel` frame is only sent once the server has
    /// announced the response id; otherwise the next turn sends it while
    /// draining. The connection is free again on return.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] when the cancel frame cannot be sent;
    /// the turn is torn down regardless.
    pub async fn cancel(&self) -> Result<(), EngineError> {
        let response_id = self
            .slot
            .lock()
            .in_flight
            .as_ref()
            .filter(|f| f.turn == self.turn && f.open)
            .and_then(|f| f.response_id.clone());
        let sent = match response_id {
            Some(response_id) => Some(
                self.sink
                    .lock()
                    .await
                    .send_frame(cancel_frame(&response_id))
                    .await,
            ),
            None => {
                tracing::debug!(turn = self.turn, "cancelling before the response id was announced");
                None
            }
        };
        self.cancel.cancel();
        release_slot(&self.slot, self.turn, sent.as_ref().is_some_and(Result::is_ok));
        sent.unwrap_or(Ok(()))
    }
}

impl Stream for TurnHandle {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::Message;

    #[test]
    fn test_create_frame_shape() {
        let frame = create_frame(json!({"model": "m", "stream": true, "input": []})).expect("frame");
        let parsed: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(parsed, json!({"type": "response.create", "model": "m", "input": []}));
        assert!(create_frame(json!([1])).is_err());
    }

    #[tokio::test]
    async fn test_slot_released_when_handle_dropped() {
        let (sink, mut outbound) = tokio::sync::mpsc::channel::<String>(4);
        let (_inbound, source) = tokio::sync::mpsc::channel::<String>(4);
        let connection = PersistentConnection::new(Box::new(sink), Box::new(source));
        let history = vec![Message::user("hi")];
        let handle = connection
            .start_turn(TurnRequest::new(&history, "gpt-test"))
            .await
            .expect("turn");
        assert!(connection.is_busy());
        assert!(outbound.recv().await.expect("frame").contains("response.create"));
        drop(handle);
        assert!(!connection.is_busy());
    }
}
