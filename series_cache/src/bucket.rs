//! bucket.rs: UTC bucket mapping utilities
//!
//! - One stable epoch: Unix (1970-01-01T00:00:00Z).
//! - Every [`Resolution`] is a fixed number of minutes, so ids are plain
//!   second-based division; days are UTC days.
//! - Bucket ids are non-negative; instants before the epoch clamp to id 0.
//!
//! All functions assume the input timestamp is UTC.

use chrono::{DateTime, Duration, Utc};

use crate::resolution::Resolution;

/// Unix epoch start (1970-01-01T00:00:00Z).
pub const EPOCH_UNIX: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Number of seconds in a minute.
pub const SECS_PER_MINUTE: i64 = 60;
/// Number of seconds in an hour.
pub const SECS_PER_HOUR: i64 = 60 * SECS_PER_MINUTE;
/// Number of seconds in a day.
pub const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;

/// Compute the bucket id for a UTC timestamp.
pub fn bucket_id(ts_utc: DateTime<Utc>, res: Resolution) -> u64 {
    let secs = ts_utc.signed_duration_since(EPOCH_UNIX).num_seconds();
    secs.div_euclid(res.secs()).max(0) as u64
}

/// Get the UTC start instant for a bucket id.
pub fn bucket_start_utc(id: u64, res: Resolution) -> DateTime<Utc> {
    // Use i128 internally to avoid accidental overflow in extreme cases.
    let offset = (id as i128) * (res.secs() as i128);
    EPOCH_UNIX + Duration::seconds(offset as i64)
}

/// Exclusive end instant for the bucket (start + width).
pub fn bucket_end_exclusive_utc(id: u64, res: Resolution) -> DateTime<Utc> {
    bucket_start_utc(id, res) + res.duration()
}

/// Start of the bucket containing `ts`.
pub fn align_down(ts: DateTime<Utc>, res: Resolution) -> DateTime<Utc> {
    bucket_start_utc(bucket_id(ts, res), res)
}

/// Smallest bucket boundary at or after `ts`.
pub fn align_up(ts: DateTime<Utc>, res: Resolution) -> DateTime<Utc> {
    bucket_start_utc(end_bucket_exclusive(ts, res), res)
}

/// True when `ts` sits exactly on a bucket boundary.
pub fn is_aligned(ts: DateTime<Utc>, res: Resolution) -> bool {
    align_down(ts, res) == ts
}

/// Id one past the last bucket that starts before `window_end`.
#[inline]
pub fn end_bucket_exclusive(window_end: DateTime<Utc>, res: Resolution) -> u64 {
    let end_id = bucket_id(window_end, res);
    if bucket_start_utc(end_id, res) < window_end {
        end_id + 1
    } else {
        end_id
    }
}
