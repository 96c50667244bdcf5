// Wall clock shared by the node and the transport layer

/// Milliseconds since the Unix epoch (UTC), zero if the clock is before it
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
