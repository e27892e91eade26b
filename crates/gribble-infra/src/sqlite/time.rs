//! Column encodings for timestamps and durations.
//!
//! Timestamps are stored as REAL seconds since the Unix epoch, with the
//! fractional part carrying sub-second precision. An unset timestamp is
//! stored as 0. Durations are stored as INTEGER nanoseconds, where a value
//! `<= 0` means "unset".

use chrono::{DateTime, Utc};

use std::time::Duration;

/// Smallest encoded value treated as a real timestamp.
const MIN_SECS: f64 = 1e-9;

/// Decode seconds since the epoch. Values at or below ~1ns, beyond the `i64`
/// range, or outside what chrono can represent decode to `None`.
pub fn from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !(secs > MIN_SECS) || secs > i64::MAX as f64 {
        return None;
    }
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

/// Encode a timestamp as seconds since the epoch; `None` encodes to 0.
pub fn to_secs(time: Option<DateTime<Utc>>) -> f64 {
    match time {
        Some(t) => t.timestamp() as f64 + f64::from(t.timestamp_subsec_nanos()) * 1e-9,
        None => 0.0,
    }
}

/// Encode an optional duration as nanoseconds, saturating at `i64::MAX`.
pub fn duration_to_nanos(duration: Option<Duration>) -> i64 {
    duration
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn nanos_to_duration(nanos: i64) -> Option<Duration> {
    u64::try_from(nanos)
        .ok()
        .filter(|n| *n > 0)
        .map(Duration::from_nanos)
}
