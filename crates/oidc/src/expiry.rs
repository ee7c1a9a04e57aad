use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::CachedTokenRecord;

/// Margin subtracted from `expires_at` before a token counts as usable.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(30);

/// Current wall-clock time in Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Whether `record` can still be used, judged against the current time.
#[must_use]
pub fn is_usable(record: &CachedTokenRecord, buffer: Duration) -> bool {
    is_usable_at(record, buffer, now_millis())
}

/// Usable iff `now < expires_at - buffer`.
#[must_use]
pub fn is_usable_at(record: &CachedTokenRecord, buffer: Duration, now_ms: u64) -> bool {
    let buffer_ms = u64::try_from(buffer.as_millis()).unwrap_or(u64::MAX);
    match record.expires_at.checked_sub(buffer_ms) {
        Some(deadline) => now_ms < deadline,
        None => false,
    }
}

/// Milliseconds of usable lifetime left, or `None` once unusable.
#[must_use]
pub fn remaining(record: &CachedTokenRecord, buffer: Duration, now_ms: u64) -> Option<Duration> {
    let buffer_ms = u64::try_from(buffer.as_millis()).unwrap_or(u64::MAX);
    record
        .expires_at
        .checked_sub(buffer_ms)
        .and_then(|deadline| deadline.checked_sub(now_ms))
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
