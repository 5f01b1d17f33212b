use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

#[inline]
pub(crate) fn new_message_id() -> String {
    let mut out = String::with_capacity(36);
    out.push_str("msg_");
    out.push_str(&uuid::Uuid::new_v4().simple().to_string());
    out
}

/// Trim a payload for inclusion in a log line or diagnostic.
pub(crate) fn truncate_for_log(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Join a base URL and a relative endpoint path with exactly one slash.
pub(crate) fn join_endpoint(base: &url::Url, path: &str) -> String {
    let base = base.as_str().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let mut out = String::with_capacity(base.len() + path.len() + 1);
    out.push_str(base);
    out.push('/');
    out.push_str(path);
    out
}
