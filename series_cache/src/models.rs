//! Domain types shared by every layer.
//!
//! - [`Bucket`]: one aggregate window for one symbol at one resolution.
//! - [`TimeRange`]: half-open `[start, end)` UTC interval.
//! - [`RawEvent`]: a price tick or sentiment-bearing article.
//! - [`Series`] / [`Freshness`]: what a historical query returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resolution::Resolution;

/// Canonical symbol form: trimmed, upper-case.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Build a range; no ordering check (see [`TimeRange::is_empty`]).
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// True when the range holds no instant.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True when `ts` lies inside the range.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Overlap of two ranges, if any.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let r = TimeRange::new(self.start.max(other.start), self.end.min(other.end));
        (!r.is_empty()).then_some(r)
    }
}

/// Aggregate for one symbol over `[bucket_start, bucket_start + resolution)`.
///
/// Invariant: `low <= open, close <= high` (see [`Bucket::is_consistent`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Aligned window start.
    pub bucket_start: DateTime<Utc>,
    /// First value in the window.
    pub open: f64,
    /// Highest value in the window.
    pub high: f64,
    /// Lowest value in the window.
    pub low: f64,
    /// Last value in the window.
    pub close: f64,
    /// Traded volume, when the source reports it.
    pub volume: Option<f64>,
    /// Mean sentiment over the window's items.
    pub sentiment_score: Option<f64>,
    /// Mean confidence over the window's items.
    pub confidence: Option<f64>,
    /// Number of sentiment-bearing items.
    pub item_count: Option<u64>,
    /// True while the window is still open.
    #[serde(default)]
    pub is_partial: bool,
}

impl Bucket {
    /// A closed bucket with only OHLC set.
    pub fn new(bucket_start: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            bucket_start,
            open,
            high,
            low,
            close,
            volume: None,
            sentiment_score: None,
            confidence: None,
            item_count: None,
            is_partial: false,
        }
    }

    /// Set the volume.
    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Set sentiment fields.
    pub fn with_sentiment(mut self, score: f64, confidence: f64, item_count: u64) -> Self {
        self.sentiment_score = Some(score);
        self.confidence = Some(confidence);
        self.item_count = Some(item_count);
        self
    }

    /// Finite values and `low <= {open, close} <= high`.
    pub fn is_consistent(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|v| v.is_finite())
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}

/// Sentiment attached to an article.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentSample {
    /// Score, conventionally in `[-1, 1]`.
    pub score: f64,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
}

/// One raw observation for a symbol.
///
/// `value` drives the OHLC fields: the trade price for ticks, the sentiment
/// score for articles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Symbol as received; normalized by consumers.
    pub symbol: String,
    /// Event time (UTC).
    pub at: DateTime<Utc>,
    /// Observed value.
    pub value: f64,
    /// Traded quantity, for ticks.
    pub volume: Option<f64>,
    /// Sentiment, for articles.
    pub sentiment: Option<SentimentSample>,
}

impl RawEvent {
    /// A price tick.
    pub fn tick(symbol: &str, at: DateTime<Utc>, price: f64, volume: Option<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            at,
            value: price,
            volume,
            sentiment: None,
        }
    }

    /// A scored article; the score doubles as the OHLC value.
    pub fn article(symbol: &str, at: DateTime<Utc>, score: f64, confidence: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            at,
            value: score,
            volume: None,
            sentiment: Some(SentimentSample { score, confidence }),
        }
    }
}

/// How trustworthy a [`Series`] is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Freshness {
    /// Every needed upstream call succeeded (or none was needed).
    Fresh,
    /// Upstream failed; the buckets come from previously stored data.
    Stale {
        /// Upstream failure message.
        reason: String,
    },
    /// Upstream failed and nothing was stored for the range.
    Partial {
        /// Sub-ranges whose base data has been obtained before.
        covered: Vec<TimeRange>,
    },
}

impl Freshness {
    /// True for [`Freshness::Fresh`].
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

/// Result of a historical query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    /// Normalized symbol.
    pub symbol: String,
    /// Requested resolution.
    pub resolution: Resolution,
    /// Aligned range actually served.
    pub range: TimeRange,
    /// Buckets ordered by start; gaps are omitted.
    pub buckets: Vec<Bucket>,
    /// Data quality marker.
    pub freshness: Freshness,
}
