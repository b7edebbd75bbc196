//! Recency cache (L1) for derived series.
//!
//! An explicitly constructed, bounded, in-process map from
//! `(symbol, resolution, range)` to an aggregated series. Callers share one
//! instance per process through `Arc<RecencyCache>`; a new instance starts
//! empty with zeroed statistics.
//!
//! - **Bounded:** at most `capacity` entries. Inserting into a full cache
//!   evicts the least recently *used* entry; a hit moves the entry to the
//!   most-recent end.
//! - **Expiry:** an entry expires at `min(inserted + ttl, next boundary)`,
//!   where the boundary is the end of the bucket containing the insertion
//!   instant for intraday resolutions and the next session open for `1D`.
//!   An expired entry counts as a miss and is dropped on lookup.
//! - **Stats:** every lookup counts as exactly one hit or one miss.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::{
    bucket::{bucket_end_exclusive_utc, bucket_id},
    config::ResolutionTable,
    models::{Bucket, TimeRange},
    resolution::Resolution,
    session::TradingSession,
};

/// Identity of a cached series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Normalized symbol.
    pub symbol: String,
    /// Resolution of the series.
    pub resolution: Resolution,
    /// Aligned range of the series.
    pub range: TimeRange,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when nothing was looked up.
    pub hit_rate: f64,
    /// Live entries (expired entries not yet looked up included).
    pub entry_count: usize,
}

struct CacheEntry {
    series: Arc<Vec<Bucket>>,
    expires_at: DateTime<Utc>,
}

/// Bounded LRU cache with resolution-aware expiry.
pub struct RecencyCache {
    entries: Mutex<IndexMap<CacheKey, CacheEntry>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    table: ResolutionTable,
    session: TradingSession,
}

impl RecencyCache {
    /// Empty cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize, table: ResolutionTable, session: TradingSession) -> Self {
        Self {
            entries: Mutex::new(IndexMap::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            table,
            session,
        }
    }

    // entries are independent; a poisoned map is still usable
    fn lock(&self) -> MutexGuard<'_, IndexMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum entry count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// When an entry for `res` inserted at `now` stops being served.
    pub fn expires_at(&self, res: Resolution, now: DateTime<Utc>) -> DateTime<Utc> {
        let by_ttl = now + self.table.get(res).ttl;
        let boundary = match res {
            Resolution::Day1 => self.session.next_open_after(now),
            _ => bucket_end_exclusive_utc(bucket_id(now, res), res),
        };
        by_ttl.min(boundary)
    }

    /// Look up `key`; refreshes recency on a hit.
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<Vec<Bucket>>> {
        let mut entries = self.lock();
        let Some(idx) = entries.get_index_of(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(symbol = %key.symbol, resolution = %key.resolution, "cache miss");
            return None;
        };
        let expired = entries
            .get_index(idx)
            .is_some_and(|(_, e)| e.expires_at <= now);
        if expired {
            entries.shift_remove_index(idx);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %key.symbol, resolution = %key.resolution, "cache entry expired");
            return None;
        }
        let last = entries.len() - 1;
        entries.move_index(idx, last);
        self.hits.fetch_add(1, Ordering::Relaxed);
        trace!(symbol = %key.symbol, resolution = %key.resolution, "cache hit");
        entries.get_index(last).map(|(_, e)| Arc::clone(&e.series))
    }

    /// Insert or replace `key`, evicting the least recently used entry when
    /// full.
    pub fn put(&self, key: CacheKey, series: Arc<Vec<Bucket>>, now: DateTime<Utc>) {
        let expires_at = self.expires_at(key.resolution, now);
        let mut entries = self.lock();
        entries.shift_remove(&key);
        while entries.len() >= self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                debug!(symbol = %evicted.symbol, resolution = %evicted.resolution, "cache evicted lru entry");
            }
        }
        entries.insert(key, CacheEntry { series, expires_at });
    }

    /// Drop every entry (stats are kept).
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            entry_count: self.len(),
        }
    }

    /// Zero the hit and miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        // Monday 10:02 New York
        Utc.with_ymd_and_hms(2024, 1, 15, 15, 2, 0).unwrap()
    }

    fn cache(cap: usize) -> RecencyCache {
        RecencyCache::new(cap, ResolutionTable::defaults(), TradingSession::us_equities())
    }

    fn key(sym: &str, res: Resolution) -> CacheKey {
        CacheKey {
            symbol: sym.to_string(),
            resolution: res,
            range: TimeRange::new(now() - Duration::days(1), now()),
        }
    }

    fn series() -> Arc<Vec<Bucket>> {
        Arc::new(vec![Bucket::new(now(), 1.0, 1.0, 1.0, 1.0)])
    }

    #[test]
    fn eviction_is_lru_not_fifo() {
        let c = cache(2);
        c.put(key("A", Resolution::Hour1), series(), now());
        c.put(key("B", Resolution::Hour1), series(), now());
        assert!(c.get(&key("A", Resolution::Hour1), now()).is_some());
        c.put(key("C", Resolution::Hour1), series(), now());

        assert!(c.get(&key("A", Resolution::Hour1), now()).is_some());
        assert!(c.get(&key("B", Resolution::Hour1), now()).is_none());
        assert!(c.get(&key("C", Resolution::Hour1), now()).is_some());
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn ttl_expiry_counts_as_miss() {
        let c = cache(4);
        let k = key("A", Resolution::Minute5);
        c.put(k.clone(), series(), now());
        // 10:02 -> the 5m bucket ends at 10:05
        assert_eq!(c.expires_at(Resolution::Minute5, now()), now() + Duration::minutes(3));
        assert!(c.get(&k, now() + Duration::minutes(2)).is_some());
        assert!(c.get(&k, now() + Duration::minutes(3)).is_none());
        assert!(c.is_empty());

        let s = c.stats();
        assert_eq!((s.hits, s.misses), (1, 1));
    }

    #[test]
    fn daily_entries_expire_at_next_session_open() {
        let c = cache(1);
        let next_open = Utc.with_ymd_and_hms(2024, 1, 16, 14, 30, 0).unwrap();
        assert_eq!(c.expires_at(Resolution::Day1, now()), (now() + Duration::days(1)).min(next_open));
        assert_eq!(c.expires_at(Resolution::Day1, now()), next_open);
    }

    #[test]
    fn stats_and_reset() {
        let c = cache(4);
        assert_eq!(c.stats().hit_rate, 0.0);
        let k = key("A", Resolution::Hour1);
        assert!(c.get(&k, now()).is_none());
        c.put(k.clone(), series(), now());
        for _ in 0..3 {
            assert!(c.get(&k, now()).is_some());
        }
        let s = c.stats();
        assert_eq!((s.hits, s.misses, s.entry_count), (3, 1, 1));
        assert!((s.hit_rate - 0.75).abs() < 1e-12);

        c.reset_stats();
        let s = c.stats();
        assert_eq!((s.hits, s.misses, s.entry_count), (0, 0, 1));
    }

    #[test]
    fn replacing_a_key_does_not_evict_others() {
        let c = cache(2);
        c.put(key("A", Resolution::Hour1), series(), now());
        c.put(key("B", Resolution::Hour1), series(), now());
        c.put(key("A", Resolution::Hour1), series(), now());
        assert_eq!(c.len(), 2);
        assert!(c.get(&key("B", Resolution::Hour1), now()).is_some());
    }
}
