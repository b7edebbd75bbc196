//! Engine configuration: parsing, normalization, and loading.
//!
//! All values are static: they are read once at startup and never negotiated
//! at runtime. The TOML shape:
//!
//! ```toml
//! source = "primary"
//! database_url = "series_cache.db"
//!
//! [cache]
//! max_entries = 1024
//! range_policy = "reject"        # or "truncate"
//!
//! [live]
//! push_interval_ms = 2000
//! significant_change = 0.005     # relative close move that triggers a push
//!
//! [session]
//! timezone = "America/New_York"
//! open = "09:30"
//! close = "16:00"
//! weekdays_only = true
//! always_open = false
//!
//! [aggregation]
//! sentiment_weighting = "count_weighted"   # or "unweighted"
//!
//! [resolutions."1m"]
//! ttl_secs = 60
//! retention_days = 365
//! max_buckets = 10080
//! ```
//!
//! Key behaviors:
//! - Every section is optional; missing values fall back to
//!   [`ResolutionTable::defaults`] and the `Default` impls below.
//! - Resolution keys are parsed into [`Resolution`]; unknown keys are errors.
//! - Zero TTLs, retention horizons, bucket limits, cache sizes and push
//!   intervals are rejected.
//!
//! Entrypoints: [`load_config_str`], [`load_config_path`].

use std::path::Path;

use anyhow::Context;
use chrono::{Duration, NaiveTime};
use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{aggregate::SentimentWeighting, resolution::Resolution, session::TradingSession};

/// Validation failures for [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `[resolutions.X]` key is not a supported resolution.
    #[error("unknown resolution key {0:?}")]
    UnknownResolution(String),
    /// A numeric field that must be positive is zero.
    #[error("{field} must be greater than zero")]
    ZeroValue {
        /// Dotted path of the offending field.
        field: String,
    },
    /// `session.timezone` is not an IANA name.
    #[error("unknown time zone {0:?}")]
    BadTimezone(String),
    /// `session.open` / `session.close` is not `HH:MM`.
    #[error("{field}: expected HH:MM, got {value:?}")]
    BadTime {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Raw value.
        value: String,
    },
    /// The session calendar is unusable.
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
    /// `live.significant_change` must be a finite, non-negative ratio.
    #[error("live.significant_change must be finite and >= 0, got {0}")]
    BadThreshold(f64),
    /// `source` is blank.
    #[error("source must not be empty")]
    EmptySource,
}

/// What to do with a query spanning more buckets than the resolution allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Fail with `RangeTooLarge`.
    #[default]
    Reject,
    /// Keep the most recent `max_buckets` windows.
    Truncate,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Upstream source name recorded with every stored bucket.
    pub source: String,
    /// SQLite path or `sqlite:` URL.
    pub database_url: String,
    /// Recency cache settings.
    pub cache: CacheCfg,
    /// Live push settings.
    pub live: LiveCfg,
    /// Trading session calendar.
    pub session: SessionCfg,
    /// Aggregation policy.
    pub aggregation: AggregationCfg,
    /// Per-resolution overrides keyed by label (`"1m"`, `"1h"`, ...).
    pub resolutions: IndexMap<String, ResolutionCfg>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source: "primary".to_string(),
            database_url: "series_cache.db".to_string(),
            cache: CacheCfg::default(),
            live: LiveCfg::default(),
            session: SessionCfg::default(),
            aggregation: AggregationCfg::default(),
            resolutions: IndexMap::new(),
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheCfg {
    /// Maximum number of cached series across all keys.
    pub max_entries: usize,
    /// Oversized range handling.
    pub range_policy: RangePolicy,
}

impl Default for CacheCfg {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            range_policy: RangePolicy::Reject,
        }
    }
}

/// `[live]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct LiveCfg {
    /// Periodic push interval in milliseconds.
    pub push_interval_ms: u64,
    /// Relative close change that triggers an immediate push.
    pub significant_change: f64,
}

impl Default for LiveCfg {
    fn default() -> Self {
        Self {
            push_interval_ms: 2_000,
            significant_change: 0.005,
        }
    }
}

impl LiveCfg {
    /// Push interval as a std duration (for tokio timers).
    pub fn push_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.push_interval_ms)
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionCfg {
    /// IANA zone the hours are expressed in.
    pub timezone: String,
    /// Local open, `HH:MM`.
    pub open: String,
    /// Local close, `HH:MM`.
    pub close: String,
    /// Skip Saturdays and Sundays.
    pub weekdays_only: bool,
    /// 24/7 market; the other fields are ignored.
    pub always_open: bool,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            open: "09:30".to_string(),
            close: "16:00".to_string(),
            weekdays_only: true,
            always_open: false,
        }
    }
}

/// `[aggregation]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AggregationCfg {
    /// How sentiment and confidence are averaged across constituents.
    pub sentiment_weighting: SentimentWeighting,
}

/// `[resolutions."<label>"]` override; unset fields keep the default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResolutionCfg {
    /// Cache TTL in seconds.
    pub ttl_secs: Option<u64>,
    /// Persisted retention horizon in days.
    pub retention_days: Option<u32>,
    /// Maximum buckets a single query may span.
    pub max_buckets: Option<u64>,
}

/// Effective settings for one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionSettings {
    /// Upper bound on a cache entry's lifetime.
    pub ttl: Duration,
    /// How long persisted buckets are kept.
    pub retention: Duration,
    /// Largest span (in buckets) a query may request.
    pub max_buckets: u64,
}

/// Settings for every [`Resolution`], indexed by [`Resolution::index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionTable {
    settings: [ResolutionSettings; 7],
}

impl ResolutionTable {
    /// Built-in table: TTL equals the bucket width, retention grows with
    /// coarseness, spans are capped around a week of minutes.
    pub fn defaults() -> Self {
        let row = |ttl_secs: i64, retention_days: i64, max_buckets: u64| ResolutionSettings {
            ttl: Duration::seconds(ttl_secs),
            retention: Duration::days(retention_days),
            max_buckets,
        };
        Self {
            settings: [
                row(60, 365, 10_080),
                row(300, 730, 8_640),
                row(900, 730, 8_640),
                row(1_800, 1_095, 8_640),
                row(3_600, 1_825, 8_760),
                row(14_400, 1_825, 4_380),
                row(86_400, 3_650, 3_650),
            ],
        }
    }

    /// Settings for `res`.
    pub fn get(&self, res: Resolution) -> &ResolutionSettings {
        &self.settings[res.index()]
    }

    /// Replace the settings for `res`.
    pub fn set(&mut self, res: Resolution, settings: ResolutionSettings) {
        self.settings[res.index()] = settings;
    }
}

impl Default for ResolutionTable {
    fn default() -> Self {
        Self::defaults()
    }
}

impl EngineConfig {
    /// Check every field; returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::EmptySource);
        }
        if self.cache.max_entries == 0 {
            return Err(zero("cache.max_entries"));
        }
        if self.live.push_interval_ms == 0 {
            return Err(zero("live.push_interval_ms"));
        }
        let threshold = self.live.significant_change;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::BadThreshold(threshold));
        }
        self.resolution_table()?;
        self.trading_session()?;
        Ok(())
    }

    /// Defaults merged with the `[resolutions]` overrides.
    pub fn resolution_table(&self) -> Result<ResolutionTable, ConfigError> {
        let mut table = ResolutionTable::defaults();
        for (label, cfg) in &self.resolutions {
            let res: Resolution = label
                .parse()
                .map_err(|_| ConfigError::UnknownResolution(label.clone()))?;
            let mut s = *table.get(res);
            if let Some(ttl) = cfg.ttl_secs {
                if ttl == 0 {
                    return Err(zero(&format!("resolutions.{label}.ttl_secs")));
                }
                s.ttl = Duration::seconds(ttl as i64);
            }
            if let Some(days) = cfg.retention_days {
                if days == 0 {
                    return Err(zero(&format!("resolutions.{label}.retention_days")));
                }
                s.retention = Duration::days(days as i64);
            }
            if let Some(max) = cfg.max_buckets {
                if max == 0 {
                    return Err(zero(&format!("resolutions.{label}.max_buckets")));
                }
                s.max_buckets = max;
            }
            table.set(res, s);
        }
        Ok(table)
    }

    /// Session calendar described by `[session]`.
    pub fn trading_session(&self) -> Result<TradingSession, ConfigError> {
        let s = &self.session;
        if s.always_open {
            return Ok(TradingSession::always_open());
        }
        let tz: Tz = s
            .timezone
            .parse()
            .map_err(|_| ConfigError::BadTimezone(s.timezone.clone()))?;
        let open = parse_hhmm("session.open", &s.open)?;
        let close = parse_hhmm("session.close", &s.close)?;
        Ok(TradingSession::new(tz, open, close, s.weekdays_only)?)
    }
}

fn zero(field: &str) -> ConfigError {
    ConfigError::ZeroValue {
        field: field.to_string(),
    }
}

fn parse_hhmm(field: &'static str, raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| ConfigError::BadTime {
        field,
        value: raw.to_string(),
    })
}

/// Parse and validate a TOML string.
pub fn load_config_str(s: &str) -> anyhow::Result<EngineConfig> {
    let mut cfg: EngineConfig = toml::from_str(s).context("parse engine config TOML")?;
    cfg.source = cfg.source.trim().to_string();
    cfg.validate().context("validate engine config")?;
    Ok(cfg)
}

/// Read, parse and validate a TOML file.
pub fn load_config_path(path: impl AsRef<Path>) -> anyhow::Result<EngineConfig> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    load_config_str(&s).with_context(|| format!("load config {}", path.display()))
}
