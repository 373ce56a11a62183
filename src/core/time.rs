//! Shared timestamp/event helpers for deterministic envelopes.

use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", now_epoch_secs())
}

/// Returns unix-epoch seconds as a number.
pub fn now_epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Monotonic-ish event identifier for audit rows and report envelopes.
pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Parse an epoch timestamp in the `<secs>Z` envelope format.
pub fn parse_epoch_z(ts: &str) -> Option<u64> {
    ts.trim_end_matches('Z').parse::<u64>().ok()
}
