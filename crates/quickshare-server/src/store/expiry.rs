//! Lazy expiration. Liveness is decided on every read, so correctness never
//! depends on the background sweep; the sweep only reclaims storage.

use std::time::{SystemTime, UNIX_EPOCH};

use super::model::PasteRecord;

const SECONDS_PER_HOUR: i64 = 3600;

/// Current Unix time in seconds.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// False once a paste is destroyed or `now` has reached its expiry.
pub fn is_live(record: &PasteRecord, now: i64) -> bool {
    if record.destroyed {
        return false;
    }
    match record.expires_at {
        Some(exp) => now < exp,
        None => true,
    }
}

/// True when every allowed view has been committed.
pub fn is_exhausted(record: &PasteRecord) -> bool {
    matches!(record.max_views, Some(max) if record.view_count >= max)
}

/// Whether a row should be treated as gone. Covers both time and view limits,
/// which are evaluated independently.
pub fn is_dead(record: &PasteRecord, now: i64) -> bool {
    !is_live(record, now) || is_exhausted(record)
}

/// Absolute expiry for a lifetime in hours. `0` means never.
pub fn expires_at_from_hours(now: i64, hours: u64) -> Option<i64> {
    if hours == 0 {
        return None;
    }
    let secs = i64::try_from(hours)
        .unwrap_or(i64::MAX)
        .saturating_mul(SECONDS_PER_HOUR);
    Some(now.saturating_add(secs))
}
