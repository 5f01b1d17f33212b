pub mod anthropic;
pub mod canonical;
pub mod error_shapes;
pub mod openai_chat;
pub mod openai_responses;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::protocol::canonical::{GenerationControls, Message, ModelInfo, ToolSpec};

/// Everything a wire builder needs to serialize one turn.
///
/// `history` is expected to be normalized already; builders translate it
/// verbatim and never repair it.
#[derive(Debug, Clone, Copy)]
pub struct TurnParts<'a> {
    pub model: &'a str,
    pub history: &'a [Message],
    pub controls: &'a GenerationControls,
    pub tools: &'a [ToolSpec],
    pub stream: bool,
}

/// Serialize a typed request and merge passthrough overrides last, later
/// pairs replacing earlier keys.
///
/// # Errors
///
/// Returns [`EngineError::InvalidRequest`] when the request cannot be
/// serialized into a JSON object.
pub fn to_wire_body<T: Serialize>(
    request: &T,
    controls: &GenerationControls,
) -> Result<Value, EngineError> {
    let mut body = serde_json::to_value(request)
        .map_err(|e| EngineError::InvalidRequest(format!("request serialization failed: {e}")))?;
    let Value::Object(map) = &mut body else {
        return Err(EngineError::InvalidRequest(
            "request did not serialize to a JSON object".to_string(),
        ));
    };
    controls.overrides.merge_passthrough_into(map);
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct ModelListBody {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Parse a `{"data": [{"id": ..}]}` model listing; both vendor families use
/// this envelope.
///
/// # Errors
///
/// Returns [`EngineError::Decoding`] when the body is not a model listing.
pub fn parse_model_list(body: &str) -> Result<Vec<ModelInfo>, EngineError> {
    let list: ModelListBody = serde_json::from_str(body)
        .map_err(|e| EngineError::Decoding(format!("malformed model list: {e}")))?;
    Ok(list
        .data
        .into_iter()
        .map(|entry| ModelInfo {
            id: entry.id,
            display_name: entry.display_name,
        })
        .collect())
}

/// Default thinking budget for a named effort level.
pub(crate) fn effort_budget_tokens(effort: &str) -> u64 {
    match effort {
        "minimal" | "low" => 1024,
        "high" => 16_384,
        _ => 4096,
    }
}

/// Named effort level closest to an explicit thinking budget.
pub(crate) fn effort_for_budget(budget: u64) -> &'static str {
    match budget {
        0..=2048 => "low",
        2049..=8192 => "medium",
        _ => "high",
    }
}
