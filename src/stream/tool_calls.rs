use serde_json::Value;
use smallvec::SmallVec;

use crate::protocol::canonical::{Signature, StreamEvent, ToolArguments, ToolCall};
use crate::util::truncate_for_log;

#[derive(Debug)]
struct PendingCall {
    call_id: Option<String>,
    name: Option<String>,
    arguments: String,
    signature: Option<Signature>,
    started: bool,
}

impl PendingCall {
    fn staged() -> Self {
        Self {
            call_id: None,
            name: None,
            arguments: String::new(),
            signature: None,
            started: false,
        }
    }

    fn call_id(&self) -> &str {
        self.call_id.as_deref().unwrap_or_default()
    }

    fn header(&self, arguments: ToolArguments) -> ToolCall {
        ToolCall {
            id: self.call_id().to_string(),
            name: self.name.clone().unwrap_or_default(),
            arguments,
            signature: self.signature.clone(),
        }
    }
}

/// Buffers partial tool-call argument text per in-flight call.
///
/// Keys are engine-local: a content-block index for index-addressed dialects,
/// a provider item id for item-addressed ones, a chunk-local integer for
/// delta-merged chunks. Entries keep insertion order so that
/// [`ToolCallAccumulator::finish_all`] closes calls in the order they opened.
#[derive(Debug)]
pub struct ToolCallAccumulator<K> {
    active: SmallVec<[(K, PendingCall); 4]>,
}

impl<K> Default for ToolCallAccumulator<K> {
    fn default() -> Self {
        Self {
            active: SmallVec::new(),
        }
    }
}

impl<K: PartialEq + std::fmt::Debug> ToolCallAccumulator<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    #[must_use]
    pub fn is_active(&self, key: &K) -> bool {
        self.position(key).is_some()
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.active.iter().position(|(k, _)| k == key)
    }

    fn entry_mut(&mut self, key: &K) -> Option<&mut PendingCall> {
        self.active
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, call)| call)
    }

    /// Open a call and emit `ToolCallStart` with empty arguments.
    ///
    /// A duplicate start for an already started key emits nothing; the later
    /// id and name replace the earlier ones.
    pub fn start(&mut self, key: K, call_id: &str, name: &str, out: &mut Vec<StreamEvent>) {
        if let Some(existing) = self.entry_mut(&key) {
            existing.call_id = Some(call_id.to_string());
            existing.name = Some(name.to_string());
            if existing.started {
                tracing::debug!(?key, call_id, "duplicate tool call start ignored");
                return;
            }
            existing.started = true;
            out.push(StreamEvent::ToolCallStart(
                existing.header(ToolArguments::new()),
            ));
            if !existing.arguments.is_empty() {
                out.push(StreamEvent::ToolCallDelta {
                    id: existing.call_id().to_string(),
                    fragment: existing.arguments.clone(),
                });
            }
            return;
        }

        let call = PendingCall {
            call_id: Some(call_id.to_string()),
            name: Some(name.to_string()),
            arguments: String::new(),
            signature: None,
            started: true,
        };
        out.push(StreamEvent::ToolCallStart(call.header(ToolArguments::new())));
        self.active.push((key, call));
    }

    /// Append an argument fragment and emit `ToolCallDelta`.
    ///
    /// Unknown keys and empty fragments are ignored.
    pub fn append(&mut self, key: &K, fragment: &str, out: &mut Vec<StreamEvent>) {
        if fragment.is_empty() {
            return;
        }
        let Some(call) = self.entry_mut(key) else {
            tracing::debug!(?key, "argument fragment for unknown tool call ignored");
            return;
        };
        call.arguments.push_str(fragment);
        if call.started {
            out.push(StreamEvent::ToolCallDelta {
                id: call.call_id().to_string(),
                fragment: fragment.to_string(),
            });
        }
    }

    /// Lazily create or update an entry from a partial delta.
    ///
    /// `ToolCallStart` is emitted the first time both an id and a name are
    /// known; arguments buffered before that are flushed as one delta.
    pub fn stage(
        &mut self,
        key: K,
        call_id: Option<&str>,
        name: Option<&str>,
        fragment: Option<&str>,
        out: &mut Vec<StreamEvent>,
    ) {
        let idx = match self.position(&key) {
            Some(idx) => idx,
            None => {
                self.active.push((key, PendingCall::staged()));
                self.active.len() - 1
            }
        };
        let call = &mut self.active[idx].1;

        if let Some(id) = call_id.filter(|id| !id.is_empty()) {
            if call.call_id.is_none() {
                call.call_id = Some(id.to_string());
            }
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            if call.name.is_none() {
                call.name = Some(name.to_string());
            }
        }
        let fragment = fragment.unwrap_or_default();
        call.arguments.push_str(fragment);

        if !call.started {
            if call.call_id.is_some() && call.name.is_some() {
                call.started = true;
                out.push(StreamEvent::ToolCallStart(call.header(ToolArguments::new())));
                if !call.arguments.is_empty() {
                    out.push(StreamEvent::ToolCallDelta {
                        id: call.call_id().to_string(),
                        fragment: call.arguments.clone(),
                    });
                }
            }
        } else if !fragment.is_empty() {
            out.push(StreamEvent::ToolCallDelta {
                id: call.call_id().to_string(),
                fragment: fragment.to_string(),
            });
        }
    }

    pub fn attach_signature(&mut self, key: &K, signature: Signature) {
        if let Some(call) = self.entry_mut(key) {
            call.signature = Some(signature);
        }
    }

    /// Close a call: parse its buffer and emit `ToolCallEnd`.
    ///
    /// Returns `false` when the key was unknown or the call was dropped
    /// because its arguments were not one JSON object.
    pub fn finish(&mut self, key: &K, out: &mut Vec<StreamEvent>) -> bool {
        let Some(idx) = self.position(key) else {
            return false;
        };
        let (_, call) = self.active.remove(idx);
        finalize_call(call, out)
    }

    /// Close a call using the provider's authoritative full argument text.
    ///
    /// When no fragment has been seen yet, the full text is first emitted as
    /// a single delta so that deltas and the final arguments stay consistent.
    pub fn finish_with(&mut self, key: &K, arguments: &str, out: &mut Vec<StreamEvent>) -> bool {
        let needs_backfill = self
            .entry_mut(key)
            .is_some_and(|call| call.arguments.is_empty());
        if needs_backfill {
            self.append(key, arguments, out);
        }
        self.finish(key, out)
    }

    /// Close every open call in insertion order.
    pub fn finish_all(&mut self, out: &mut Vec<StreamEvent>) {
        for (_, call) in self.active.drain(..) {
            finalize_call(call, out);
        }
    }
}

fn finalize_call(call: PendingCall, out: &mut Vec<StreamEvent>) -> bool {
    if !call.started {
        tracing::warn!(
            call_id = call.call_id(),
            "dropping tool call that never received both an id and a name"
        );
        return false;
    }
    let Some(arguments) = parse_arguments(&call.arguments) else {
        tracing::warn!(
            call_id = call.call_id(),
            arguments = truncate_for_log(&call.arguments, 200),
            "dropping tool call with malformed arguments"
        );
        return false;
    };
    out.push(StreamEvent::ToolCallEnd(call.header(arguments)));
    true
}

/// Parse a fully assembled argument buffer. An empty buffer means no
/// arguments; anything other than a JSON object is rejected.
fn parse_arguments(buffer: &str) -> Option<ToolArguments> {
    let trimmed = buffer.trim();
    if trimmed.is_empty() {
        return Some(ToolArguments::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
