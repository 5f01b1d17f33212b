/// Error type shared by decoders, the history layer, transports and adapters.
///
/// The same value is carried inside [`crate::protocol::canonical::StreamEvent::Error`]
/// when a failure is surfaced as the terminal item of a turn, so it is cheap
/// to clone and comparable in tests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Content filtered: {0}")]
    ContentFiltered(String),
    #[error("Provider error: code={code}, message={message}")]
    Provider { code: String, message: String },
    #[error("Decoding error: {0}")]
    Decoding(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Turn cancelled")]
    Cancelled,
}

/// Broad error category, used for retry and key-validation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 404 | 413 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl EngineError {
    #[must_use]
    pub fn provider(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::InvalidRequest(_) | EngineError::ContentFiltered(_) => {
                ErrorCategory::InvalidRequest
            }
            EngineError::Provider { code, .. } => provider_code_category(code),
            EngineError::Decoding(_)
            | EngineError::Transport(_)
            | EngineError::Config(_) => ErrorCategory::ServerError,
            EngineError::Cancelled => ErrorCategory::Unknown,
        }
    }
}

/// Provider codes are either a numeric HTTP status (when the error came from
/// the transport) or a vendor error type string.
fn provider_code_category(code: &str) -> ErrorCategory {
    if let Ok(status) = code.parse::<u16>() {
        return category_from_upstream_status(status);
    }
    match code {
        "invalid_request_error" | "invalid_request" | "not_found_error" => {
            ErrorCategory::InvalidRequest
        }
        "authentication_error" | "invalid_api_key" => ErrorCategory::Authentication,
        "permission_error" => ErrorCategory::Permission,
        "rate_limit_error" | "rate_limit_exceeded" => ErrorCategory::RateLimit,
        "api_error" | "overloaded_error" | "server_error" => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}
