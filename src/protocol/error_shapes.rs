use serde::Deserialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::util::truncate_for_log;

const MAX_RAW_BODY_IN_MESSAGE: usize = 512;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorObject,
}

/// Both vendor families nest `{type?, code?, message}` under `error`.
#[derive(Debug, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

impl ErrorObject {
    fn code(&self) -> Option<String> {
        match &self.code {
            Some(Value::String(code)) if !code.is_empty() => Some(code.clone()),
            Some(Value::Number(code)) => Some(code.to_string()),
            _ => self.kind.clone().filter(|kind| !kind.is_empty()),
        }
    }
}

/// Turn a non-success HTTP response into a [`EngineError::Provider`].
///
/// Recognizes the Anthropic (`{"type":"error","error":{"type",..}}`) and
/// OpenAI (`{"error":{"code","type",..}}`) shapes. Anything else keeps the
/// numeric status as the code and a truncated body as the message.
#[must_use]
pub fn provider_error_from_body(status: u16, body: &str) -> EngineError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => {
            let code = error.code().unwrap_or_else(|| status.to_string());
            let message = error
                .message
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| format!("upstream returned HTTP {status}"));
            EngineError::provider(code, message)
        }
        Err(_) => {
            let trimmed = body.trim();
            let message = if trimmed.is_empty() {
                format!("upstream returned HTTP {status}")
            } else {
                truncate_for_log(trimmed, MAX_RAW_BODY_IN_MESSAGE).to_string()
            };
            EngineError::provider(status.to_string(), message)
        }
    }
}
