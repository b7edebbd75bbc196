use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{resolution::ParseResolutionError, resolution::Resolution, store::StoreError};

/// Errors returned by historical queries.
///
/// Upstream failures are not errors: they degrade the result's
/// [`Freshness`](crate::models::Freshness) instead.
#[derive(Debug, Error)]
pub enum SeriesError {
    /// The resolution label is not one of the supported set.
    #[error(transparent)]
    InvalidResolution(#[from] ParseResolutionError),

    /// The symbol is blank.
    #[error("symbol must not be empty")]
    InvalidSymbol,

    /// `start` is not before `end`.
    #[error("invalid range: start {start} is not before end {end}")]
    InvalidRange {
        /// Requested start.
        start: DateTime<Utc>,
        /// Requested end.
        end: DateTime<Utc>,
    },

    /// The range spans more buckets than the resolution allows.
    #[error("range of {requested} {resolution} buckets exceeds the limit of {max}")]
    RangeTooLarge {
        /// Requested resolution.
        resolution: Resolution,
        /// Buckets the aligned range spans.
        requested: u64,
        /// Configured maximum.
        max: u64,
    },

    /// The persistent store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}
