//! Persistent bucket store (the second cache tier).
//!
//! The store keeps closed buckets keyed by `(symbol, source, resolution,
//! bucket_start)` plus a per-series coverage bitmap recording which base
//! bucket ids have already been obtained from upstream. Coverage is what lets
//! the service tell "nothing traded" apart from "never fetched".
//!
//! [`BucketStore`] is the portable surface; [`sqlite::SqliteStore`] is the
//! Diesel/SQLite implementation.

use std::ops::Range;

use chrono::{DateTime, Utc};
use roaring::RoaringBitmap;
use thiserror::Error;

use crate::{
    models::{Bucket, TimeRange, normalize_symbol},
    resolution::Resolution,
};

pub mod coverage;
pub mod rows;
pub mod sqlite;

pub use sqlite::SqliteStore;

/// Errors raised by a [`BucketStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    /// The connection could not be opened or configured.
    #[error("connection error: {0}")]
    Connection(String),
    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(String),
    /// A bucket failed validation before being written.
    #[error("invalid bucket at {bucket_start}: {reason}")]
    InvalidBucket {
        /// Start of the offending bucket.
        bucket_start: DateTime<Utc>,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// Stored data could not be decoded.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    /// A bucket id does not fit the coverage bitmap.
    #[error("bucket id {0} exceeds coverage range")]
    IdOverflow(u64),
    /// A previous panic poisoned the connection lock.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Identifies one stored series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    /// Normalized symbol.
    pub symbol: String,
    /// Upstream source name.
    pub source: String,
    /// Bucket width.
    pub resolution: Resolution,
}

impl SeriesKey {
    /// Build a key; the symbol is normalized.
    pub fn new(symbol: &str, source: &str, resolution: Resolution) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            source: source.to_string(),
            resolution,
        }
    }

    /// Key for the base-resolution series of `symbol`.
    pub fn base(symbol: &str, source: &str) -> Self {
        Self::new(symbol, source, Resolution::BASE)
    }
}

/// Durable storage for closed buckets and their coverage.
///
/// Implementations are blocking; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait BucketStore: Send + Sync {
    /// Insert or replace buckets. Re-writing identical data is a no-op in
    /// effect; a differing bucket replaces the stored one. Returns the number
    /// of rows written.
    fn upsert_buckets(&self, key: &SeriesKey, buckets: &[Bucket]) -> StoreResult<usize>;

    /// Stored buckets with `range.start <= bucket_start < range.end`, ordered
    /// by start.
    fn range(&self, key: &SeriesKey, range: TimeRange) -> StoreResult<Vec<Bucket>>;

    /// Bucket ids (at `key.resolution`) already obtained from upstream.
    fn coverage(&self, key: &SeriesKey) -> StoreResult<RoaringBitmap>;

    /// Record `ids` as obtained from upstream.
    fn mark_covered(&self, key: &SeriesKey, ids: Range<u64>) -> StoreResult<()>;

    /// Delete buckets past their retention horizon. Returns rows removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}
