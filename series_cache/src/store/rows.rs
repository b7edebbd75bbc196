//! Row mapping between [`Bucket`] and the `buckets` table.
//!
//! All timestamps are stored as RFC-3339 UTC strings with millisecond
//! precision (`2024-01-15T14:30:00.000Z`), so lexicographic order in SQLite is
//! chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;

use super::{SeriesKey, StoreError, StoreResult};
use crate::{models::Bucket, schema::buckets};

/// Format a UTC instant the way the store persists it.
pub fn to_rfc3339_millis(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC-3339 timestamp (any offset) into UTC.
pub fn parse_ts_to_utc(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad rfc3339 {s:?}: {e}")))
}

/// One `buckets` row.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = buckets)]
#[diesel(primary_key(symbol, source, resolution, bucket_start))]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct BucketRow {
    /// Normalized symbol.
    pub symbol: String,
    /// Upstream source.
    pub source: String,
    /// Resolution label.
    pub resolution: String,
    /// Window start.
    pub bucket_start: String,
    /// Open.
    pub open: f64,
    /// High.
    pub high: f64,
    /// Low.
    pub low: f64,
    /// Close.
    pub close: f64,
    /// Volume.
    pub volume: Option<f64>,
    /// Mean sentiment.
    pub sentiment_score: Option<f64>,
    /// Mean confidence.
    pub confidence: Option<f64>,
    /// Sentiment item count.
    pub item_count: Option<i64>,
    /// Retention deadline.
    pub expires_at: String,
}

impl BucketRow {
    /// Row for `bucket` under `key`, expiring at `expires_at`.
    pub fn from_bucket(key: &SeriesKey, bucket: &Bucket, expires_at: DateTime<Utc>) -> Self {
        Self {
            symbol: key.symbol.clone(),
            source: key.source.clone(),
            resolution: key.resolution.label().to_string(),
            bucket_start: to_rfc3339_millis(bucket.bucket_start),
            open: bucket.open,
            high: bucket.high,
            low: bucket.low,
            close: bucket.close,
            volume: bucket.volume,
            sentiment_score: bucket.sentiment_score,
            confidence: bucket.confidence,
            item_count: bucket.item_count.map(|n| n.min(i64::MAX as u64) as i64),
            expires_at: to_rfc3339_millis(expires_at),
        }
    }

    /// Decode back into a closed [`Bucket`].
    pub fn into_bucket(self) -> StoreResult<Bucket> {
        let item_count = match self.item_count {
            Some(n) => Some(
                u64::try_from(n)
                    .map_err(|_| StoreError::Corrupt(format!("negative item_count {n}")))?,
            ),
            None => None,
        };
        Ok(Bucket {
            bucket_start: parse_ts_to_utc(&self.bucket_start)?,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            sentiment_score: self.sentiment_score,
            confidence: self.confidence,
            item_count,
            is_partial: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolution::Resolution;
    use chrono::{Duration, TimeZone};

    #[test]
    fn millis_format_sorts_lexicographically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 15, 9, 59, 0).unwrap();
        let b = a + Duration::minutes(1);
        assert_eq!(to_rfc3339_millis(a), "2024-01-15T09:59:00.000Z");
        assert!(to_rfc3339_millis(a) < to_rfc3339_millis(b));
    }

    #[test]
    fn offsets_normalize_to_utc() {
        let got = parse_ts_to_utc("2024-03-10T09:30:00-05:00").unwrap();
        assert_eq!(got, Utc.with_ymd_and_hms(2024, 3, 10, 14, 30, 0).unwrap());
        assert!(matches!(parse_ts_to_utc("yesterday"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn row_preserves_optional_fields() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        let key = SeriesKey::new("aapl", "test", Resolution::Minute1);
        let bucket = Bucket::new(t, 1.0, 2.0, 0.5, 1.5).with_sentiment(0.2, 0.9, 3);
        let row = BucketRow::from_bucket(&key, &bucket, t + Duration::days(1));
        assert_eq!(row.symbol, "AAPL");
        assert_eq!(row.resolution, "1m");
        assert_eq!(row.volume, None);
        assert_eq!(row.into_bucket().unwrap(), bucket);
    }
}
