//! Historical query path: L1 cache, L2 store, upstream, aggregation.
//!
//! `get_series(symbol, resolution, start, end)`:
//!
//! 1. Validate the resolution, symbol and range; widen the range to whole
//!    target buckets and apply the span limit (reject or truncate).
//! 2. Serve from the [`RecencyCache`] when a live entry exists.
//! 3. Otherwise consult the store's coverage bitmap and fetch only the base
//!    sub-ranges never obtained before. During the active session the
//!    in-progress base bucket is always fetched again. Fetched buckets are
//!    written through to the store and marked covered, except the
//!    in-progress bucket while the session is active.
//! 4. Aggregate stored base buckets to the target resolution. Only fully
//!    fresh results are cached.
//! 5. Flag buckets whose window has not ended as partial and overlay the
//!    live tracker's open window when a [`LiveFeed`] is attached.
//!
//! Upstream failures never fail a query: the result is served from stored
//! data as [`Freshness::Stale`], or as [`Freshness::Partial`] with the covered
//! sub-ranges when nothing is stored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use roaring::RoaringBitmap;
use tracing::{debug, info, warn};

use crate::{
    aggregate::Aggregator,
    bucket::{
        align_down, align_up, bucket_end_exclusive_utc, bucket_id, bucket_start_utc,
        end_bucket_exclusive, is_aligned,
    },
    cache::{CacheKey, CacheStats, RecencyCache},
    clock::Clock,
    config::{ConfigError, EngineConfig, RangePolicy, ResolutionTable},
    errors::SeriesError,
    live::LiveFeed,
    models::{Bucket, Freshness, Series, TimeRange, normalize_symbol},
    providers::BaseBucketFetcher,
    resolution::Resolution,
    session::TradingSession,
    store::{
        BucketStore, SeriesKey, StoreResult,
        coverage::{compute_missing, covered_ranges, id_range_u32},
    },
    tracker::Topic,
};

/// One entry of a batch lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRequest {
    /// Symbol, any case.
    pub symbol: String,
    /// Resolution label (`"5m"`, `"1D"`, ...).
    pub resolution: String,
    /// Range start (inclusive).
    pub start: DateTime<Utc>,
    /// Range end (exclusive).
    pub end: DateTime<Utc>,
}

/// Entry point for historical queries against one upstream source.
pub struct SeriesService {
    source: String,
    store: Arc<dyn BucketStore>,
    fetcher: Arc<dyn BaseBucketFetcher>,
    cache: Arc<RecencyCache>,
    aggregator: Aggregator,
    table: ResolutionTable,
    session: TradingSession,
    range_policy: RangePolicy,
    clock: Arc<dyn Clock>,
    live: Option<Arc<LiveFeed>>,
}

impl SeriesService {
    /// Build a service from validated configuration with a fresh cache.
    pub fn from_config(
        cfg: &EngineConfig,
        store: Arc<dyn BucketStore>,
        fetcher: Arc<dyn BaseBucketFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let table = cfg.resolution_table()?;
        let session = cfg.trading_session()?;
        let cache = Arc::new(RecencyCache::new(
            cfg.cache.max_entries,
            table.clone(),
            session.clone(),
        ));
        Ok(Self {
            source: cfg.source.clone(),
            aggregator: Aggregator::new(Arc::clone(&store), cfg.aggregation.sentiment_weighting),
            store,
            fetcher,
            cache,
            table,
            session,
            range_policy: cfg.cache.range_policy,
            clock,
            live: None,
        })
    }

    /// Overlay `live`'s open windows onto query results.
    pub fn with_live(mut self, live: Arc<LiveFeed>) -> Self {
        self.live = Some(live);
        self
    }

    /// Share an existing cache instead of the one built from config.
    pub fn with_cache(mut self, cache: Arc<RecencyCache>) -> Self {
        self.cache = cache;
        self
    }

    /// The cache this service reads and fills.
    pub fn cache(&self) -> &Arc<RecencyCache> {
        &self.cache
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Zero cache counters.
    pub fn reset_stats(&self) {
        self.cache.reset_stats();
    }

    /// Query by resolution label.
    pub async fn get_series(
        &self,
        symbol: &str,
        resolution: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Series, SeriesError> {
        let res: Resolution = resolution.parse()?;
        self.series(symbol, res, TimeRange::new(start, end)).await
    }

    /// Run several queries concurrently; each gets its own result.
    pub async fn get_many(&self, requests: &[SeriesRequest]) -> Vec<Result<Series, SeriesError>> {
        join_all(
            requests
                .iter()
                .map(|r| self.get_series(&r.symbol, &r.resolution, r.start, r.end)),
        )
        .await
    }

    /// Typed query.
    pub async fn series(
        &self,
        symbol: &str,
        res: Resolution,
        requested: TimeRange,
    ) -> Result<Series, SeriesError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(SeriesError::InvalidSymbol);
        }
        let range = self.plan_range(res, requested)?;
        let now = self.clock.now();
        let key = CacheKey {
            symbol: symbol.clone(),
            resolution: res,
            range,
        };

        let (mut buckets, freshness) = match self.cache.get(&key, now) {
            Some(hit) => (Vec::clone(&hit), Freshness::Fresh),
            None => {
                let (buckets, freshness) = self.load(&symbol, res, range, now).await?;
                if freshness.is_fresh() {
                    self.cache.put(key, Arc::new(buckets.clone()), now);
                }
                (buckets, freshness)
            }
        };

        mark_open_windows(&mut buckets, res, now);
        self.overlay_live(&symbol, res, range, &mut buckets);

        Ok(Series {
            symbol,
            resolution: res,
            range,
            buckets,
            freshness,
        })
    }

    /// Validate, align and size-limit a requested range.
    pub fn plan_range(&self, res: Resolution, requested: TimeRange) -> Result<TimeRange, SeriesError> {
        if requested.is_empty() {
            return Err(SeriesError::InvalidRange {
                start: requested.start,
                end: requested.end,
            });
        }
        let start_id = bucket_id(requested.start, res);
        let end_id = end_bucket_exclusive(requested.end, res);
        let requested_buckets = end_id.saturating_sub(start_id);
        let max = self.table.get(res).max_buckets;
        let mut range = TimeRange::new(align_down(requested.start, res), align_up(requested.end, res));
        if requested_buckets > max {
            match self.range_policy {
                RangePolicy::Reject => {
                    return Err(SeriesError::RangeTooLarge {
                        resolution: res,
                        requested: requested_buckets,
                        max,
                    });
                }
                RangePolicy::Truncate => {
                    range.start = bucket_start_utc(end_id - max, res);
                    debug!(resolution = %res, requested = requested_buckets, max, "range truncated");
                }
            }
        }
        Ok(range)
    }

    async fn load(
        &self,
        symbol: &str,
        res: Resolution,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Bucket>, Freshness), SeriesError> {
        let base = Resolution::BASE;
        let key = SeriesKey::base(symbol, &self.source);
        let mut coverage = {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            blocking(move || store.coverage(&key)).await?
        };

        let active = self.session.is_active(now);
        let now_id = bucket_id(now, base);
        let to_fetch = self.ranges_to_fetch(&coverage, range, active, now_id)?;

        let mut failure: Option<String> = None;
        for window in to_fetch {
            match self.fetcher.fetch_base_buckets(symbol, &self.source, window).await {
                Ok(fetched) => {
                    let clean = sanitize(fetched, window);
                    let ids = bucket_id(window.start, base)..end_bucket_exclusive(window.end, base);
                    // the in-progress bucket stays uncovered while it can still change
                    let covered_end = if active { ids.end.min(now_id) } else { ids.end };
                    let covered = ids.start..covered_end.max(ids.start);
                    debug!(
                        symbol,
                        start = %window.start,
                        end = %window.end,
                        fetched = clean.len(),
                        "fetched base buckets"
                    );
                    let store = Arc::clone(&self.store);
                    let key = key.clone();
                    let marked = covered.clone();
                    blocking(move || {
                        store.upsert_buckets(&key, &clean)?;
                        store.mark_covered(&key, marked)
                    })
                    .await?;
                    if !covered.is_empty() {
                        coverage.insert_range(id_range_u32(covered)?);
                    }
                }
                Err(e) => {
                    warn!(symbol, start = %window.start, end = %window.end, error = %e, "upstream fetch failed");
                    failure.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let buckets = {
            let aggregator = self.aggregator.clone();
            let symbol = symbol.to_string();
            let source = self.source.clone();
            blocking(move || aggregator.load(&symbol, &source, res, range)).await?
        };

        let freshness = match failure {
            None => Freshness::Fresh,
            Some(reason) if !buckets.is_empty() => Freshness::Stale { reason },
            Some(_) => Freshness::Partial {
                covered: covered_ranges(&coverage, range, base)?,
            },
        };
        if !freshness.is_fresh() {
            info!(symbol, resolution = %res, freshness = ?freshness, "serving degraded series");
        }
        Ok((buckets, freshness))
    }

    /// Uncovered base sub-ranges of `range`, never past the bucket holding
    /// `now`, plus that bucket itself during the active session.
    fn ranges_to_fetch(
        &self,
        coverage: &RoaringBitmap,
        range: TimeRange,
        active: bool,
        now_id: u64,
    ) -> StoreResult<Vec<TimeRange>> {
        let base = Resolution::BASE;
        let horizon = bucket_end_exclusive_utc(now_id, base);
        let clip = TimeRange::new(range.start, range.end.min(horizon));
        if clip.is_empty() {
            return Ok(vec![]);
        }
        let mut out = compute_missing(coverage, clip, base)?;
        if active {
            let in_progress = TimeRange::new(bucket_start_utc(now_id, base), horizon);
            let already = out.iter().any(|r| r.contains(in_progress.start));
            if !already && clip.contains(in_progress.start) {
                match out.last_mut() {
                    Some(last) if last.end == in_progress.start => last.end = in_progress.end,
                    _ => out.push(in_progress),
                }
            }
        }
        Ok(out)
    }

    fn overlay_live(&self, symbol: &str, res: Resolution, range: TimeRange, buckets: &mut Vec<Bucket>) {
        let Some(live) = &self.live else {
            return;
        };
        let Some(snap) = live.snapshot(&Topic::new(symbol, res)) else {
            return;
        };
        let Some(live_bucket) = snap.bucket else {
            return;
        };
        if !range.contains(live_bucket.bucket_start) {
            return;
        }
        match buckets.binary_search_by_key(&live_bucket.bucket_start, |b| b.bucket_start) {
            Ok(i) => merge_live(&mut buckets[i], &live_bucket),
            Err(i) => buckets.insert(i, live_bucket),
        }
    }
}

/// Fold the live view of a window into the stored view of the same window.
///
/// Both describe the window from its start, so volume takes the larger of the
/// two instead of the sum. Sentiment comes from whichever side counted more
/// items.
fn merge_live(stored: &mut Bucket, live: &Bucket) {
    stored.high = stored.high.max(live.high);
    stored.low = stored.low.min(live.low);
    stored.close = live.close;
    stored.volume = match (stored.volume, live.volume) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    if live.item_count.unwrap_or(0) > stored.item_count.unwrap_or(0) {
        stored.sentiment_score = live.sentiment_score;
        stored.confidence = live.confidence;
        stored.item_count = live.item_count;
    }
    stored.is_partial = true;
}

/// Flag every bucket whose window has not ended at `now`.
fn mark_open_windows(buckets: &mut [Bucket], res: Resolution, now: DateTime<Utc>) {
    for b in buckets.iter_mut().rev() {
        if b.bucket_start + res.duration() <= now {
            break;
        }
        if b.bucket_start <= now {
            b.is_partial = true;
        }
    }
}

/// Keep aligned, consistent buckets inside `window`, ordered and unique.
fn sanitize(mut fetched: Vec<Bucket>, window: TimeRange) -> Vec<Bucket> {
    let before = fetched.len();
    fetched.retain(|b| {
        window.contains(b.bucket_start) && is_aligned(b.bucket_start, Resolution::BASE) && b.is_consistent()
    });
    if fetched.len() != before {
        warn!(dropped = before - fetched.len(), "discarded malformed upstream buckets");
    }
    for b in &mut fetched {
        b.is_partial = false;
    }
    fetched.sort_by_key(|b| b.bucket_start);
    fetched.dedup_by_key(|b| b.bucket_start);
    fetched
}

async fn blocking<T, F>(f: F) -> Result<T, SeriesError>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SeriesError::Task(e.to_string()))?
        .map_err(SeriesError::from)
}
