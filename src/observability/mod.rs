use std::time::Duration;

use crate::protocol::canonical::Usage;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// A subscriber that is already installed is left in place.
pub fn init_tracing(log_level: &str) {
    let Some(directive) = tracing_directive(log_level) else {
        return;
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

fn tracing_directive(log_level: &str) -> Option<String> {
    let level = log_level.to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Log one line for a finished turn.
pub fn log_turn_complete(provider: &str, model: &str, usage: Option<&Usage>, elapsed: Duration) {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match usage {
        Some(usage) => tracing::info!(
            provider,
            model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            thinking_tokens = usage.thinking_tokens,
            cached_tokens = usage.cached_tokens,
            service_tier = usage.service_tier.as_deref(),
            elapsed_ms,
            "turn complete"
        ),
        None => tracing::info!(provider, model, elapsed_ms, "turn complete (usage not reported)"),
    }
}
