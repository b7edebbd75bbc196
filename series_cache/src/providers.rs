//! Upstream abstraction for base-resolution data.
//!
//! A [`BaseBucketFetcher`] answers "give me every base bucket for this symbol
//! in this range". The service only calls it for sub-ranges the store has not
//! covered yet. Implementations are selected at runtime through
//! `Arc<dyn BaseBucketFetcher>`.
//!
//! # Example
//!
//! ```rust
//! # use series_cache::providers::{BaseBucketFetcher, FetchError};
//! # use series_cache::models::{Bucket, TimeRange};
//! # use async_trait::async_trait;
//! struct Vendor;
//! #[async_trait]
//! impl BaseBucketFetcher for Vendor {
//!     async fn fetch_base_buckets(
//!         &self,
//!         symbol: &str,
//!         source: &str,
//!         range: TimeRange,
//!     ) -> Result<Vec<Bucket>, FetchError> {
//!         Ok(vec![])
//!     }
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Bucket, TimeRange};

/// Upstream failures. All of them degrade a query instead of failing it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The source could not be reached (network, timeout, offline mode).
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    /// The source refused the request (rate limit, unknown symbol).
    #[error("upstream rejected request: {0}")]
    Rejected(String),
    /// Anything else.
    #[error("upstream error: {0}")]
    Internal(String),
}

/// Fetches closed base-resolution buckets from an upstream source.
#[async_trait]
pub trait BaseBucketFetcher: Send + Sync {
    /// Every base bucket of `symbol` from `source` with
    /// `range.start <= bucket_start < range.end`.
    ///
    /// Windows with no activity are simply absent from the result.
    async fn fetch_base_buckets(
        &self,
        symbol: &str,
        source: &str,
        range: TimeRange,
    ) -> Result<Vec<Bucket>, FetchError>;
}

/// A fetcher with no upstream; every call reports [`FetchError::Unavailable`].
///
/// Used by the CLI to serve whatever is already stored.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

#[async_trait]
impl BaseBucketFetcher for OfflineFetcher {
    async fn fetch_base_buckets(
        &self,
        _symbol: &str,
        _source: &str,
        _range: TimeRange,
    ) -> Result<Vec<Bucket>, FetchError> {
        Err(FetchError::Unavailable("offline mode".to_string()))
    }
}
