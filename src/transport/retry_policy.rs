use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

/// Pre-stream retry schedule for upstream calls.
///
/// Only failures observed before any response byte reaches the decoder are
/// retried; once a stream is open its errors end the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Upper bound applied to a server-provided `Retry-After`.
    pub retry_after_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            retry_after_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 429, 503 and Anthropic's 529 "overloaded".
    #[must_use]
    pub fn retryable_status(status: http::StatusCode) -> bool {
        matches!(status.as_u16(), 429 | 503 | 529)
    }

    /// Connection-level failures worth another attempt.
    #[must_use]
    pub fn retryable_transport(err: &reqwest::Error) -> bool {
        if err.is_timeout() || err.is_connect() {
            return true;
        }
        is_transient_message(&err.to_string())
    }

    /// Exponential backoff for `attempt` (0-based), capped at `backoff_max`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(10);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// `Retry-After` when present and parseable, else backoff.
    #[must_use]
    pub fn status_delay(&self, headers: &http::HeaderMap, attempt: u32) -> Duration {
        self.retry_after(headers)
            .unwrap_or_else(|| self.backoff(attempt))
    }

    /// Delta-seconds or an HTTP date, capped at `retry_after_cap`.
    #[must_use]
    pub fn retry_after(&self, headers: &http::HeaderMap) -> Option<Duration> {
        let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
        if raw.is_empty() {
            return None;
        }
        let delay = match raw.parse::<u64>() {
            Ok(seconds) => Duration::from_secs(seconds),
            Err(_) => {
                let target = httpdate::parse_http_date(raw).ok()?;
                target.duration_since(SystemTime::now()).unwrap_or_default()
            }
        };
        Some(delay.min(self.retry_after_cap))
    }
}

fn is_transient_message(message: &str) -> bool {
    const NEEDLES: [&str; 6] = [
        "connection reset",
        "connection aborted",
        "broken pipe",
        "unexpected eof",
        "http2 error",
        "connection closed before message completed",
    ];
    let lowered = message.to_ascii_lowercase();
    NEEDLES
        .iter()
        .any(|needle| memchr::memmem::find(lowered.as_bytes(), needle.as_bytes()).is_some())
}
