use chrono::Utc;

/// Wall-clock time in epoch milliseconds, the unit every persisted timestamp uses.
pub fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
