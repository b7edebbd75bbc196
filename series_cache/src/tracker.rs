//! Live in-flight buckets for watched `(symbol, resolution)` topics.
//!
//! The tracker owns one [`PartialBucket`] per watched topic. Each event is
//! folded in O(1): running OHLC keyed on event time (so a late-arriving but
//! in-window event can still become the open, and close always reflects the
//! latest timestamp), running sentiment/confidence means, item count and
//! volume.
//!
//! Window lifecycle:
//! - an event at or after the window end finalizes the current window (if it
//!   saw any data) and opens the window containing the event;
//! - [`PartialBucketTracker::sweep`] does the same for windows that ended
//!   without a further event, so two consecutive windows are never open at
//!   once;
//! - events before the current window are ignored.
//!
//! Finalized buckets come back in [`TrackerOutput::finalized`]; persisting
//! them is the caller's job. The window open when a topic starts being
//! watched may have missed earlier events, so it is flagged incomplete.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    bucket::{bucket_end_exclusive_utc, bucket_id, bucket_start_utc},
    models::{Bucket, RawEvent, normalize_symbol},
    resolution::Resolution,
};

/// A live stream: one symbol at one resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Topic {
    /// Normalized symbol.
    pub symbol: String,
    /// Window width.
    pub resolution: Resolution,
}

impl Topic {
    /// Topic for `symbol` (normalized) at `resolution`.
    pub fn new(symbol: &str, resolution: Resolution) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            resolution,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.resolution)
    }
}

/// Point-in-time view of a topic's open window, as pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialSnapshot {
    /// Normalized symbol.
    pub symbol: String,
    /// Window width.
    pub resolution: Resolution,
    /// Bucket id of the window; strictly increases across rollovers.
    pub window_index: u64,
    /// Window start.
    pub window_start: DateTime<Utc>,
    /// Window end (exclusive).
    pub window_end: DateTime<Utc>,
    /// Share of the window elapsed at the last observation, in `[0, 1]`.
    pub elapsed_fraction: f64,
    /// Running aggregate; `None` until the window sees an event.
    pub bucket: Option<Bucket>,
}

impl PartialSnapshot {
    /// Topic this snapshot belongs to.
    pub fn topic(&self) -> Topic {
        Topic {
            symbol: self.symbol.clone(),
            resolution: self.resolution,
        }
    }
}

#[derive(Debug, Clone)]
struct Running {
    open: f64,
    open_at: DateTime<Utc>,
    high: f64,
    low: f64,
    close: f64,
    close_at: DateTime<Utc>,
    volume: Option<f64>,
    sentiment_mean: f64,
    confidence_mean: f64,
    items: u64,
}

impl Running {
    fn first(ev: &RawEvent) -> Self {
        let mut r = Self {
            open: ev.value,
            open_at: ev.at,
            high: ev.value,
            low: ev.value,
            close: ev.value,
            close_at: ev.at,
            volume: None,
            sentiment_mean: 0.0,
            confidence_mean: 0.0,
            items: 0,
        };
        r.fold_extras(ev);
        r
    }

    fn fold(&mut self, ev: &RawEvent) {
        if ev.at < self.open_at {
            self.open = ev.value;
            self.open_at = ev.at;
        }
        if ev.at >= self.close_at {
            self.close = ev.value;
            self.close_at = ev.at;
        }
        self.high = self.high.max(ev.value);
        self.low = self.low.min(ev.value);
        self.fold_extras(ev);
    }

    fn fold_extras(&mut self, ev: &RawEvent) {
        if let Some(v) = ev.volume.filter(|v| v.is_finite()) {
            *self.volume.get_or_insert(0.0) += v;
        }
        if let Some(s) = ev.sentiment {
            if s.score.is_finite() && s.confidence.is_finite() {
                self.items += 1;
                let n = self.items as f64;
                self.sentiment_mean += (s.score - self.sentiment_mean) / n;
                self.confidence_mean += (s.confidence - self.confidence_mean) / n;
            }
        }
    }

    fn to_bucket(&self, start: DateTime<Utc>, is_partial: bool) -> Bucket {
        let has_items = self.items > 0;
        Bucket {
            bucket_start: start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            sentiment_score: has_items.then_some(self.sentiment_mean),
            confidence: has_items.then_some(self.confidence_mean),
            item_count: has_items.then_some(self.items),
            is_partial,
        }
    }
}

/// The open window of one topic.
#[derive(Debug, Clone)]
pub struct PartialBucket {
    resolution: Resolution,
    window_index: u64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    observed_at: DateTime<Utc>,
    complete: bool,
    state: Option<Running>,
}

impl PartialBucket {
    fn open(resolution: Resolution, at: DateTime<Utc>, complete: bool) -> Self {
        let id = bucket_id(at, resolution);
        let window_start = bucket_start_utc(id, resolution);
        Self {
            resolution,
            window_index: id,
            window_start,
            window_end: bucket_end_exclusive_utc(id, resolution),
            observed_at: at,
            complete: complete || at == window_start,
            state: None,
        }
    }

    /// Close this window; `Some` only if it saw data. Consumes the state so a
    /// window is finalized at most once.
    fn finalize(&mut self, topic: &Topic) -> Option<Finalized> {
        self.state.take().map(|r| Finalized {
            topic: topic.clone(),
            bucket: r.to_bucket(self.window_start, false),
            complete: self.complete,
        })
    }

    fn elapsed_fraction(&self) -> f64 {
        let width = self.resolution.secs() as f64 * 1_000.0;
        let elapsed = (self.observed_at - self.window_start).num_milliseconds() as f64;
        (elapsed / width).clamp(0.0, 1.0)
    }

    fn snapshot(&self, symbol: &str) -> PartialSnapshot {
        PartialSnapshot {
            symbol: symbol.to_string(),
            resolution: self.resolution,
            window_index: self.window_index,
            window_start: self.window_start,
            window_end: self.window_end,
            elapsed_fraction: self.elapsed_fraction(),
            bucket: self.state.as_ref().map(|r| r.to_bucket(self.window_start, true)),
        }
    }
}

/// A closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    /// Owning topic.
    pub topic: Topic,
    /// Closed bucket (`is_partial == false`).
    pub bucket: Bucket,
    /// False when watching began after the window opened.
    pub complete: bool,
}

/// What one tracker call changed.
#[derive(Debug, Default, Clone)]
pub struct TrackerOutput {
    /// Current view of every topic the call touched.
    pub snapshots: Vec<PartialSnapshot>,
    /// Windows that closed with data, oldest first per topic.
    pub finalized: Vec<Finalized>,
    /// Topics whose window rolled over.
    pub rolled_over: Vec<Topic>,
}

impl TrackerOutput {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.finalized.is_empty() && self.rolled_over.is_empty()
    }
}

/// Owns the live state of every watched topic.
#[derive(Debug, Default)]
pub struct PartialBucketTracker {
    watched: HashMap<String, BTreeMap<Resolution, PartialBucket>>,
}

impl PartialBucketTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `topic` with an empty window containing `now`.
    /// Returns false if it was already watched.
    pub fn watch(&mut self, topic: &Topic, now: DateTime<Utc>) -> bool {
        let per_symbol = self.watched.entry(topic.symbol.clone()).or_default();
        if per_symbol.contains_key(&topic.resolution) {
            return false;
        }
        per_symbol.insert(topic.resolution, PartialBucket::open(topic.resolution, now, false));
        debug!(topic = %topic, "watching");
        true
    }

    /// Stop tracking `topic`, discarding its open window.
    pub fn unwatch(&mut self, topic: &Topic) -> bool {
        let Some(per_symbol) = self.watched.get_mut(&topic.symbol) else {
            return false;
        };
        let removed = per_symbol.remove(&topic.resolution).is_some();
        if per_symbol.is_empty() {
            self.watched.remove(&topic.symbol);
        }
        removed
    }

    /// True when `topic` is watched.
    pub fn is_watched(&self, topic: &Topic) -> bool {
        self.watched
            .get(&topic.symbol)
            .is_some_and(|m| m.contains_key(&topic.resolution))
    }

    /// Every watched topic.
    pub fn topics(&self) -> Vec<Topic> {
        self.watched
            .iter()
            .flat_map(|(sym, m)| m.keys().map(|&r| Topic::new(sym, r)))
            .collect()
    }

    /// Fold one event into every watched resolution of its symbol.
    pub fn apply(&mut self, ev: &RawEvent) -> TrackerOutput {
        let mut out = TrackerOutput::default();
        if !ev.value.is_finite() {
            warn!(symbol = %ev.symbol, value = ev.value, "dropping non-finite event");
            return out;
        }
        let symbol = normalize_symbol(&ev.symbol);
        let Some(per_symbol) = self.watched.get_mut(&symbol) else {
            return out;
        };
        for (&res, pb) in per_symbol.iter_mut() {
            let id = bucket_id(ev.at, res);
            if id < pb.window_index {
                debug!(symbol = %symbol, resolution = %res, at = %ev.at, "late event ignored");
                continue;
            }
            if id > pb.window_index {
                let topic = Topic::new(&symbol, res);
                out.finalized.extend(pb.finalize(&topic));
                *pb = PartialBucket::open(res, ev.at, true);
                out.rolled_over.push(topic);
            }
            match pb.state.as_mut() {
                Some(r) => r.fold(ev),
                None => pb.state = Some(Running::first(ev)),
            }
            pb.observed_at = pb.observed_at.max(ev.at);
            out.snapshots.push(pb.snapshot(&symbol));
        }
        out
    }

    /// Close every window that ended at or before `now` and advance all
    /// windows' elapsed fraction. Returns a snapshot for every topic.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> TrackerOutput {
        let mut out = TrackerOutput::default();
        for (symbol, per_symbol) in self.watched.iter_mut() {
            for (&res, pb) in per_symbol.iter_mut() {
                if pb.window_end <= now {
                    let topic = Topic::new(symbol, res);
                    out.finalized.extend(pb.finalize(&topic));
                    *pb = PartialBucket::open(res, now, true);
                    out.rolled_over.push(topic);
                } else {
                    pb.observed_at = pb.observed_at.max(now);
                }
                out.snapshots.push(pb.snapshot(symbol));
            }
        }
        out
    }

    /// Current view of `topic`.
    pub fn snapshot(&self, topic: &Topic) -> Option<PartialSnapshot> {
        self.watched
            .get(&topic.symbol)?
            .get(&topic.resolution)
            .map(|pb| pb.snapshot(&topic.symbol))
    }

    /// Current view of every watched topic.
    pub fn snapshots(&self) -> Vec<PartialSnapshot> {
        self.watched
            .iter()
            .flat_map(|(sym, m)| m.values().map(move |pb| pb.snapshot(sym)))
            .collect()
    }
}
