//! Derive coarse buckets from base buckets.
//!
//! One linear pass over start-ordered base buckets, grouping them by the
//! target bucket id. For every window that has at least one constituent:
//!
//! | field | rule |
//! |---|---|
//! | `open` | first constituent's open |
//! | `close` | last constituent's close |
//! | `high` / `low` | max / min over constituents |
//! | `volume` | sum of present volumes, `None` when none present |
//! | `sentiment_score`, `confidence` | mean per [`SentimentWeighting`] |
//! | `item_count` | sum of present counts |
//!
//! Windows with no constituents are omitted: a missing window means "no
//! activity", never a synthesized flat bucket.

use std::{borrow::Cow, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    bucket::{bucket_id, bucket_start_utc},
    models::{Bucket, TimeRange},
    resolution::Resolution,
    store::{BucketStore, SeriesKey, StoreResult},
};

/// How sentiment and confidence are averaged across constituents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentWeighting {
    /// Weight each constituent by its `item_count` (missing counts weigh 1,
    /// zero counts are skipped).
    #[default]
    CountWeighted,
    /// Every constituent carrying a value weighs the same.
    Unweighted,
}

impl SentimentWeighting {
    fn weight(self, b: &Bucket) -> f64 {
        match self {
            SentimentWeighting::CountWeighted => b.item_count.unwrap_or(1) as f64,
            SentimentWeighting::Unweighted => 1.0,
        }
    }
}

#[derive(Default)]
struct WeightedMean {
    sum: f64,
    weight: f64,
}

impl WeightedMean {
    fn add(&mut self, value: Option<f64>, weight: f64) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            if weight > 0.0 {
                self.sum += v * weight;
                self.weight += weight;
            }
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.weight > 0.0).then(|| self.sum / self.weight)
    }
}

struct Window {
    id: u64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: Option<f64>,
    sentiment: WeightedMean,
    confidence: WeightedMean,
    item_count: Option<u64>,
    is_partial: bool,
}

impl Window {
    fn start(id: u64, b: &Bucket, weighting: SentimentWeighting) -> Self {
        let mut w = Self {
            id,
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: None,
            sentiment: WeightedMean::default(),
            confidence: WeightedMean::default(),
            item_count: None,
            is_partial: false,
        };
        w.absorb_extras(b, weighting);
        w
    }

    fn push(&mut self, b: &Bucket, weighting: SentimentWeighting) {
        self.high = self.high.max(b.high);
        self.low = self.low.min(b.low);
        self.close = b.close;
        self.absorb_extras(b, weighting);
    }

    fn absorb_extras(&mut self, b: &Bucket, weighting: SentimentWeighting) {
        if let Some(v) = b.volume {
            *self.volume.get_or_insert(0.0) += v;
        }
        if let Some(n) = b.item_count {
            *self.item_count.get_or_insert(0) += n;
        }
        let weight = weighting.weight(b);
        self.sentiment.add(b.sentiment_score, weight);
        self.confidence.add(b.confidence, weight);
        self.is_partial |= b.is_partial;
    }

    fn finish(self, target: Resolution) -> Bucket {
        Bucket {
            bucket_start: bucket_start_utc(self.id, target),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            sentiment_score: self.sentiment.mean(),
            confidence: self.confidence.mean(),
            item_count: self.item_count,
            is_partial: self.is_partial,
        }
    }
}

/// Roll `base` up into `target` buckets covering `range`.
///
/// Constituents outside `range` are ignored. Input is expected ordered by
/// `bucket_start` (as the store returns it); unordered input is sorted first.
pub fn aggregate(
    base: &[Bucket],
    target: Resolution,
    range: TimeRange,
    weighting: SentimentWeighting,
) -> Vec<Bucket> {
    let base: Cow<'_, [Bucket]> = if base.is_sorted_by_key(|b| b.bucket_start) {
        Cow::Borrowed(base)
    } else {
        let mut v = base.to_vec();
        v.sort_by_key(|b| b.bucket_start);
        Cow::Owned(v)
    };

    let mut out = Vec::new();
    let mut current: Option<Window> = None;
    for b in base.iter().filter(|b| range.contains(b.bucket_start)) {
        let id = bucket_id(b.bucket_start, target);
        match current.as_mut() {
            Some(w) if w.id == id => w.push(b, weighting),
            _ => {
                if let Some(done) = current.replace(Window::start(id, b, weighting)) {
                    out.push(done.finish(target));
                }
            }
        }
    }
    if let Some(done) = current {
        out.push(done.finish(target));
    }
    out
}

/// Reads base buckets from a store and aggregates them.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn BucketStore>,
    weighting: SentimentWeighting,
}

impl Aggregator {
    /// Aggregator over `store`.
    pub fn new(store: Arc<dyn BucketStore>, weighting: SentimentWeighting) -> Self {
        Self { store, weighting }
    }

    /// Weighting policy in use.
    pub fn weighting(&self) -> SentimentWeighting {
        self.weighting
    }

    /// Stored base buckets of `symbol`/`source` rolled up to `target`.
    ///
    /// Blocking: reads the store.
    pub fn load(
        &self,
        symbol: &str,
        source: &str,
        target: Resolution,
        range: TimeRange,
    ) -> StoreResult<Vec<Bucket>> {
        let base = self.store.range(&SeriesKey::base(symbol, source), range)?;
        if target.is_base() {
            return Ok(base);
        }
        Ok(aggregate(&base, target, range, self.weighting))
    }
}
