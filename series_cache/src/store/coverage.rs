//! Coverage bitmaps: which bucket ids have been obtained from upstream.
//!
//! Bitmaps are persisted in the portable Roaring format. Ids are bucket ids
//! at the series' resolution and must fit in `u32`; minute ids stay below
//! that bound until the year 10136.

use std::{io::Cursor, ops::Range};

use chrono::{DateTime, Utc};
use roaring::RoaringBitmap;

use super::{StoreError, StoreResult};
use crate::{
    bucket::{bucket_id, bucket_start_utc, end_bucket_exclusive},
    models::TimeRange,
    resolution::Resolution,
};

/// Serialize a bitmap for the `bucket_coverage.bitmap` column.
pub fn coverage_to_bytes(rb: &RoaringBitmap) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(rb.serialized_size());
    rb.serialize_into(&mut buf)
        .map_err(|e| StoreError::Corrupt(format!("serialize coverage: {e}")))?;
    Ok(buf)
}

/// Inverse of [`coverage_to_bytes`].
pub fn coverage_from_bytes(bytes: &[u8]) -> StoreResult<RoaringBitmap> {
    RoaringBitmap::deserialize_from(Cursor::new(bytes))
        .map_err(|e| StoreError::Corrupt(format!("deserialize coverage: {e}")))
}

/// Narrow a `u64` id range to the bitmap's `u32` domain.
pub fn id_range_u32(ids: Range<u64>) -> StoreResult<Range<u32>> {
    let start = u32::try_from(ids.start).map_err(|_| StoreError::IdOverflow(ids.start))?;
    let end = u32::try_from(ids.end).map_err(|_| StoreError::IdOverflow(ids.end))?;
    Ok(start..end)
}

/// Bucket ids touched by `window`: from the bucket holding `start` up to the
/// last one starting before `end`.
pub fn window_ids(window: TimeRange, res: Resolution) -> Range<u64> {
    if window.is_empty() {
        return 0..0;
    }
    bucket_id(window.start, res)..end_bucket_exclusive(window.end, res)
}

/// Sub-ranges of `window` whose buckets are absent from `present`.
pub fn compute_missing(
    present: &RoaringBitmap,
    window: TimeRange,
    res: Resolution,
) -> StoreResult<Vec<TimeRange>> {
    let ids = window_ids(window, res);
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let mut wanted = RoaringBitmap::new();
    wanted.insert_range(id_range_u32(ids)?);
    let missing = &wanted - present;
    Ok(coalesce_runs(&missing, res))
}

/// Sub-ranges of `window` whose buckets are recorded in `present`.
pub fn covered_ranges(
    present: &RoaringBitmap,
    window: TimeRange,
    res: Resolution,
) -> StoreResult<Vec<TimeRange>> {
    let ids = window_ids(window, res);
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let mut wanted = RoaringBitmap::new();
    wanted.insert_range(id_range_u32(ids)?);
    let covered = &wanted & present;
    Ok(coalesce_runs(&covered, res))
}

/// Merge consecutive ids into contiguous UTC ranges.
fn coalesce_runs(rb: &RoaringBitmap, res: Resolution) -> Vec<TimeRange> {
    let mut out = Vec::new();
    let mut it = rb.iter();
    let Some(mut run_start) = it.next() else {
        return out;
    };
    let mut prev = run_start;
    let close = |first: u32, last: u32| {
        TimeRange::new(
            bucket_start_utc(first as u64, res),
            bucket_start_utc(last as u64 + 1, res),
        )
    };
    for x in it {
        if x == prev + 1 {
            prev = x;
            continue;
        }
        out.push(close(run_start, prev));
        run_start = x;
        prev = x;
    }
    out.push(close(run_start, prev));
    out
}

/// First id that is still within retention at `now`.
pub fn retention_floor(now: DateTime<Utc>, retention: chrono::Duration, res: Resolution) -> u64 {
    bucket_id(now - retention, res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    #[test]
    fn bytes_round_trip() {
        let mut rb = RoaringBitmap::new();
        rb.insert_range(10..20);
        rb.insert(65_535);
        let back = coverage_from_bytes(&coverage_to_bytes(&rb).unwrap()).unwrap();
        assert_eq!(rb, back);
        assert!(coverage_from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn missing_runs_are_coalesced() {
        let res = Resolution::Minute1;
        let mut present = RoaringBitmap::new();
        let ids = window_ids(TimeRange::new(t(10, 2), t(10, 4)), res);
        present.insert_range(id_range_u32(ids).unwrap());

        let missing = compute_missing(&present, TimeRange::new(t(10, 0), t(10, 6)), res).unwrap();
        assert_eq!(
            missing,
            vec![
                TimeRange::new(t(10, 0), t(10, 2)),
                TimeRange::new(t(10, 4), t(10, 6)),
            ]
        );
        let covered = covered_ranges(&present, TimeRange::new(t(10, 0), t(10, 6)), res).unwrap();
        assert_eq!(covered, vec![TimeRange::new(t(10, 2), t(10, 4))]);
    }

    #[test]
    fn fully_covered_window_has_nothing_missing() {
        let res = Resolution::Minute1;
        let window = TimeRange::new(t(9, 0), t(10, 0));
        let mut present = RoaringBitmap::new();
        present.insert_range(id_range_u32(window_ids(window, res)).unwrap());
        assert!(compute_missing(&present, window, res).unwrap().is_empty());
        assert!(compute_missing(&present, TimeRange::new(t(9, 0), t(9, 0)), res).unwrap().is_empty());
    }

    #[test]
    fn oversize_ids_are_reported() {
        assert!(matches!(
            id_range_u32(0..u64::from(u32::MAX) + 2),
            Err(StoreError::IdOverflow(_))
        ));
    }
}
