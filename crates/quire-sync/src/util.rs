//! Small helpers shared by the transport and the credential cache.

/// Longest error body kept in messages and logs.
const MAX_ERROR_TEXT: usize = 180;

/// Trim an error body down to something fit for a log line.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(MAX_ERROR_TEXT).collect()
}

/// Current Unix time in seconds, as credential expiries are stored.
pub fn unix_timestamp_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current Unix time in milliseconds, as the server reports sync times.
pub fn unix_timestamp_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
