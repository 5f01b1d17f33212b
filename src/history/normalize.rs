use rustc_hash::FxHashMap;

use crate::protocol::canonical::{Dialect, Message, Role, ToolCall, ToolResult};

/// Content of the error result synthesized for an unanswered tool call.
pub const MISSING_RESULT_CONTENT: &str = "Tool result missing (auto-generated)";

/// Rebuild `history` so each assistant tool call is answered, first, by the
/// next message.
///
/// Every dialect family enforces the same adjacency rule, so `dialect` does
/// not change the output today; it is recorded in the repair log. Reasoning
/// parts are stripped from assistant messages since their signatures are only
/// valid for the dialect that produced them. The result is a fixed point:
/// normalizing it again yields the same history.
#[must_use]
pub fn normalize_history(history: &[Message], dialect: Dialect) -> Vec<Message> {
    let recorded = latest_results(history);

    let mut out = Vec::with_capacity(history.len());
    let mut synthesized = 0usize;
    let mut dropped_assistants = 0usize;
    for message in history {
        match message.role {
            Role::Tool => {}
            Role::Assistant => {
                let content: Vec<_> = message
                    .content
                    .iter()
                    .filter(|part| !part.is_reasoning())
                    .cloned()
                    .collect();
                if content.is_empty() && message.tool_calls.is_empty() {
                    dropped_assistants += 1;
                    continue;
                }
                let assistant = Message {
                    content,
                    tool_results: Vec::new(),
                    ..message.clone()
                };
                if assistant.tool_calls.is_empty() {
                    out.push(assistant);
                    continue;
                }
                let results: Vec<ToolResult> = assistant
                    .tool_calls
                    .iter()
                    .map(|call| match recorded.get(call.id.as_str()) {
                        Some(result) => (*result).clone(),
                        None => {
                            synthesized += 1;
                            missing_result(call)
                        }
                    })
                    .collect();
                let results_message = Message {
                    id: format!("{}-results", assistant.id),
                    role: Role::Tool,
                    content: Vec::new(),
                    tool_calls: Vec::new(),
                    tool_results: results,
                    timestamp: assistant.timestamp,
                };
                out.push(assistant);
                out.push(results_message);
            }
            Role::User | Role::System => {
                if message.tool_results.is_empty() && message.tool_calls.is_empty() {
                    out.push(message.clone());
                } else {
                    // only assistant messages carry calls, only tool messages results
                    out.push(Message {
                        tool_calls: Vec::new(),
                        tool_results: Vec::new(),
                        ..message.clone()
                    });
                }
            }
        }
    }

    if synthesized > 0 || dropped_assistants > 0 {
        tracing::debug!(
            ?dialect,
            synthesized_results = synthesized,
            dropped_assistants,
            "repaired conversation history"
        );
    }
    out
}

/// Latest recorded result per call id, scanning every message.
fn latest_results(history: &[Message]) -> FxHashMap<&str, &ToolResult> {
    let mut recorded = FxHashMap::default();
    for message in history {
        for result in &message.tool_results {
            recorded.insert(result.tool_call_id.as_str(), result);
        }
    }
    recorded
}

fn missing_result(call: &ToolCall) -> ToolResult {
    ToolResult {
        tool_call_id: call.id.clone(),
        tool_name: Some(call.name.clone()),
        content: MISSING_RESULT_CONTENT.to_string(),
        is_error: true,
        signature: call.signature.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{ContentPart, RedactedBlob, Signature};

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "lookup", serde_json::Map::new())
    }

    #[test]
    fn test_missing_result_is_synthesized() {
        let mut signed = call("c1");
        signed.signature = Some(Signature::new("sig"));
        let history = vec![Message::assistant(Vec::new())
            .with_id("a1")
            .with_tool_calls(vec![signed])];
        let normalized = normalize_history(&history, Dialect::IndexedBlocks);
        assert_eq!(normalized.len(), 2);
        let results = &normalized[1];
        assert_eq!(results.role, Role::Tool);
        assert_eq!(results.id, "a1-results");
        assert_eq!(results.timestamp, normalized[0].timestamp);
        assert_eq!(
            results.tool_results,
            vec![ToolResult {
                tool_call_id: "c1".to_string(),
                tool_name: Some("lookup".to_string()),
                content: MISSING_RESULT_CONTENT.to_string(),
                is_error: true,
                signature: Some(Signature::new("sig")),
            }]
        );
    }

    #[test]
    fn test_misplaced_results_move_next_to_their_call() {
        let history = vec![
            Message::user("go"),
            Message::assistant(vec![ContentPart::text("checking")])
                .with_id("a1")
                .with_tool_calls(vec![call("c1"), call("c2")]),
            Message::user("any news?"),
            Message::tool(vec![ToolResult::success("c2", "second")]),
            Message::tool(vec![ToolResult::success("c1", "stale"), ToolResult::success("c1", "first")]),
        ];
        let normalized = normalize_history(&history, Dialect::ChatChunks);
        let roles: Vec<Role> = normalized.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::User]);
        let contents: Vec<&str> = normalized[2]
            .tool_results
            .iter()
            .map(|r| r.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[test]
    fn test_reasoning_stripped_and_empty_assistant_dropped() {
        let history = vec![
            Message::user("hi"),
            Message::assistant(vec![ContentPart::RedactedThinking(RedactedBlob::new("x"))]),
            Message::assistant(vec![
                ContentPart::Thinking {
                    text: "hmm".to_string(),
                    signature: Some(Signature::new("s")),
                },
                ContentPart::text("hello"),
            ]),
        ];
        let normalized = normalize_history(&history, Dialect::OutputItems);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[1].content, vec![ContentPart::text("hello")]);
    }

    #[test]
    fn test_stray_results_removed_from_user() {
        let history = vec![Message::user("hi").with_tool_results(vec![ToolResult::success("zz", "x")])];
        let normalized = normalize_history(&history, Dialect::IndexedBlocks);
        assert!(normalized[0].tool_results.is_empty());
    }

    #[test]
    fn test_tool_calls_removed_from_user_and_system() {
        let history = vec![
            Message::system("sys").with_tool_calls(vec![call("s1")]),
            Message::user("hi").with_tool_calls(vec![call("u1")]),
        ];
        let normalized = normalize_history(&history, Dialect::ChatChunks);
        assert_eq!(normalized.len(), 2);
        assert!(normalized.iter().all(|m| m.tool_calls.is_empty()));
        assert_eq!(normalized[1].content, vec![ContentPart::text("hi")]);
    }

    #[test]
    fn test_idempotent() {
        let history = vec![
            Message::system("sys"),
            Message::user("go"),
            Message::assistant(Vec::new())
                .with_id("a1")
                .with_tool_calls(vec![call("c1"), call("c2")]),
            Message::tool(vec![ToolResult::success("c1", "one")]),
            Message::assistant(vec![ContentPart::text("done")]),
        ];
        let once = normalize_history(&history, Dialect::IndexedBlocks);
        let twice = normalize_history(&once, Dialect::IndexedBlocks);
        assert_eq!(once, twice);
    }
}
