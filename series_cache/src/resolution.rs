//! Supported bucket granularities.
//!
//! A [`Resolution`] is a closed set of fixed-width UTC buckets. The finest one,
//! [`Resolution::BASE`], is the only resolution persisted from upstream; every
//! other resolution is an integer multiple of it and is derived on demand.
//!
//! Labels follow the short CLI form used across the workspace:
//! ```
//! use series_cache::resolution::Resolution;
//!
//! let r: Resolution = "5m".parse().unwrap();
//! assert_eq!(r, Resolution::Minute5);
//! assert_eq!(r.multiplier(), 5);
//! assert_eq!(r.to_string(), "5m");
//! ```

use std::{fmt, str::FromStr};

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::bucket::SECS_PER_MINUTE;

/// Bucket granularity. Ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    /// 1 minute (base)
    Minute1,
    /// 5 minutes
    Minute5,
    /// 15 minutes
    Minute15,
    /// 30 minutes
    Minute30,
    /// 1 hour
    Hour1,
    /// 4 hours
    Hour4,
    /// 1 UTC day
    Day1,
}

/// Returned when a label does not name a supported resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported resolution: {0:?}")]
pub struct ParseResolutionError(pub String);

impl Resolution {
    /// The finest persisted granularity.
    pub const BASE: Resolution = Resolution::Minute1;

    /// Every supported resolution, finest first.
    pub const ALL: [Resolution; 7] = [
        Resolution::Minute1,
        Resolution::Minute5,
        Resolution::Minute15,
        Resolution::Minute30,
        Resolution::Hour1,
        Resolution::Hour4,
        Resolution::Day1,
    ];

    /// Number of base buckets per bucket of this resolution.
    pub const fn multiplier(self) -> u32 {
        match self {
            Resolution::Minute1 => 1,
            Resolution::Minute5 => 5,
            Resolution::Minute15 => 15,
            Resolution::Minute30 => 30,
            Resolution::Hour1 => 60,
            Resolution::Hour4 => 240,
            Resolution::Day1 => 1440,
        }
    }

    /// Bucket width in seconds.
    pub const fn secs(self) -> i64 {
        SECS_PER_MINUTE * self.multiplier() as i64
    }

    /// Bucket width.
    pub fn duration(self) -> Duration {
        Duration::seconds(self.secs())
    }

    /// True for [`Resolution::BASE`].
    pub const fn is_base(self) -> bool {
        matches!(self, Resolution::Minute1)
    }

    /// Position in [`Resolution::ALL`]; used to index per-resolution tables.
    pub const fn index(self) -> usize {
        match self {
            Resolution::Minute1 => 0,
            Resolution::Minute5 => 1,
            Resolution::Minute15 => 2,
            Resolution::Minute30 => 3,
            Resolution::Hour1 => 4,
            Resolution::Hour4 => 5,
            Resolution::Day1 => 6,
        }
    }

    /// Short label, also the persisted form (`"1m"`, `"4h"`, `"1D"`).
    pub const fn label(self) -> &'static str {
        match self {
            Resolution::Minute1 => "1m",
            Resolution::Minute5 => "5m",
            Resolution::Minute15 => "15m",
            Resolution::Minute30 => "30m",
            Resolution::Hour1 => "1h",
            Resolution::Hour4 => "4h",
            Resolution::Day1 => "1D",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" would read as a month elsewhere in the workspace, so only the
        // day unit is case-insensitive.
        let r = match s.trim() {
            "1m" => Resolution::Minute1,
            "5m" => Resolution::Minute5,
            "15m" => Resolution::Minute15,
            "30m" => Resolution::Minute30,
            "1h" | "60m" => Resolution::Hour1,
            "4h" => Resolution::Hour4,
            "1D" | "1d" => Resolution::Day1,
            other => return Err(ParseResolutionError(other.to_string())),
        };
        Ok(r)
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
