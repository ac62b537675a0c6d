//! Shared utility functions used across multiple modules.

use chrono::{DateTime, TimeZone, Utc};

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a Unix-ms timestamp as an RFC 3339 string.
///
/// Out-of-range values fall back to the epoch rather than panicking.
pub fn ms_to_rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().expect("epoch is valid"))
        .to_rfc3339()
}

/// Parse an RFC 3339 timestamp into Unix milliseconds.
pub fn rfc3339_to_ms(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}
