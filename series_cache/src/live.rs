//! Live feed: raw events in, persisted closes and pushed snapshots out.
//!
//! [`LiveFeed`] wires the tracker to the store and the router:
//!
//! 1. [`LiveFeed::ingest`] folds an event into every watched resolution of its
//!    symbol.
//! 2. Base windows closed by the event are written to the store *before* any
//!    snapshot of the next window is published. Coarser closes are not stored;
//!    queries rebuild them from base buckets.
//! 3. Snapshots are published when they are significant: the window rolled
//!    over, it is the window's first data, or the close moved by at least
//!    `significant_change` relative to the last pushed close.
//! 4. [`LiveFeed::spawn_pump`] sweeps every `push_interval`, closing quiet
//!    windows and publishing every topic regardless of significance.
//!
//! Ingest and sweep run one at a time per feed: apply, persist and publish
//! form a single ordered step, so subscribers never see snapshots out of the
//! order the tracker produced them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bucket::bucket_id,
    clock::Clock,
    config::LiveCfg,
    fanout::{FanoutRouter, Subscription},
    models::RawEvent,
    resolution::Resolution,
    store::{BucketStore, SeriesKey, StoreError},
    tracker::{Finalized, PartialBucketTracker, PartialSnapshot, Topic, TrackerOutput},
};

/// Live path failures.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Persisting a closed window failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

struct LiveState {
    tracker: PartialBucketTracker,
    last_pushed: HashMap<Topic, f64>,
}

/// Owns live tracking for one upstream source.
pub struct LiveFeed {
    // held across apply, persist and publish
    ordered: AsyncMutex<()>,
    state: Mutex<LiveState>,
    router: FanoutRouter,
    store: Arc<dyn BucketStore>,
    source: String,
    clock: Arc<dyn Clock>,
    settings: LiveCfg,
}

impl LiveFeed {
    /// Feed persisting closes for `source` into `store`.
    pub fn new(
        store: Arc<dyn BucketStore>,
        source: &str,
        clock: Arc<dyn Clock>,
        settings: LiveCfg,
    ) -> Self {
        Self {
            ordered: AsyncMutex::new(()),
            state: Mutex::new(LiveState {
                tracker: PartialBucketTracker::new(),
                last_pushed: HashMap::new(),
            }),
            router: FanoutRouter::new(),
            store,
            source: source.to_string(),
            clock,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Router delivering this feed's snapshots.
    pub fn router(&self) -> &FanoutRouter {
        &self.router
    }

    /// Start tracking `symbol` at `resolution`. Returns false if already
    /// tracked.
    pub fn watch(&self, symbol: &str, resolution: Resolution) -> bool {
        let topic = Topic::new(symbol, resolution);
        let now = self.clock.now();
        let mut state = self.lock();
        if !state.tracker.watch(&topic, now) {
            return false;
        }
        if let Some(snap) = state.tracker.snapshot(&topic) {
            self.router.publish(snap);
        }
        true
    }

    /// Stop tracking; current subscribers see the end of their stream.
    pub fn unwatch(&self, symbol: &str, resolution: Resolution) -> bool {
        let topic = Topic::new(symbol, resolution);
        let removed = {
            let mut state = self.lock();
            state.last_pushed.remove(&topic);
            state.tracker.unwatch(&topic)
        };
        let dropped = self.router.close_topic(&topic);
        if removed {
            info!(topic = %topic, subscribers = dropped, "stopped watching");
        }
        removed
    }

    /// Subscribe to live snapshots, watching the topic if needed. The
    /// subscription starts with the current snapshot.
    pub fn subscribe(&self, symbol: &str, resolution: Resolution) -> Subscription {
        self.watch(symbol, resolution);
        self.router.subscribe(Topic::new(symbol, resolution))
    }

    /// Current open window of `topic`, if watched.
    pub fn snapshot(&self, topic: &Topic) -> Option<PartialSnapshot> {
        self.lock().tracker.snapshot(topic)
    }

    /// Fold one event. Returns how many subscriber slots were updated.
    pub async fn ingest(&self, event: RawEvent) -> Result<usize, LiveError> {
        let _ordered = self.ordered.lock().await;
        let (finalized, to_publish) = {
            let mut state = self.lock();
            let out = state.tracker.apply(&event);
            let threshold = self.settings.significant_change;
            let to_publish = select_significant(&mut state.last_pushed, &out, threshold);
            (out.finalized, to_publish)
        };
        self.persist(finalized).await?;
        Ok(self.publish_all(to_publish))
    }

    /// Close ended windows and publish every watched topic.
    pub async fn sweep(&self) -> Result<usize, LiveError> {
        let _ordered = self.ordered.lock().await;
        let now = self.clock.now();
        let (finalized, snapshots) = {
            let mut state = self.lock();
            let out = state.tracker.sweep(now);
            for topic in &out.rolled_over {
                state.last_pushed.remove(topic);
            }
            for snap in &out.snapshots {
                if let Some(b) = &snap.bucket {
                    state.last_pushed.insert(snap.topic(), b.close);
                }
            }
            (out.finalized, out.snapshots)
        };
        self.persist(finalized).await?;
        Ok(self.publish_all(snapshots))
    }

    /// Run [`LiveFeed::sweep`] every push interval until `cancel` fires.
    pub fn spawn_pump(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.settings.push_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "live pump started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "live sweep failed");
                        }
                    }
                }
            }
            info!("live pump stopped");
        })
    }

    fn publish_all(&self, snapshots: Vec<PartialSnapshot>) -> usize {
        snapshots
            .into_iter()
            .map(|snap| self.router.publish(snap))
            .sum()
    }

    async fn persist(&self, mut finalized: Vec<Finalized>) -> Result<(), LiveError> {
        finalized.retain(|done| {
            let base = done.topic.resolution.is_base();
            if !base {
                debug!(topic = %done.topic, start = %done.bucket.bucket_start, "coarse close not stored");
            }
            base
        });
        if finalized.is_empty() {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            for done in &finalized {
                let key = SeriesKey::base(&done.topic.symbol, &source);
                store.upsert_buckets(&key, std::slice::from_ref(&done.bucket))?;
                if done.complete {
                    let id = bucket_id(done.bucket.bucket_start, Resolution::BASE);
                    store.mark_covered(&key, id..id + 1)?;
                }
                debug!(topic = %done.topic, start = %done.bucket.bucket_start, "persisted closed window");
            }
            Ok(())
        })
        .await
        .map_err(|e| LiveError::Task(e.to_string()))??;
        Ok(())
    }
}

fn select_significant(
    last_pushed: &mut HashMap<Topic, f64>,
    out: &TrackerOutput,
    threshold: f64,
) -> Vec<PartialSnapshot> {
    for topic in &out.rolled_over {
        last_pushed.remove(topic);
    }
    let mut picked = Vec::new();
    for snap in &out.snapshots {
        let topic = snap.topic();
        let rolled = out.rolled_over.contains(&topic);
        let close = snap.bucket.as_ref().map(|b| b.close);
        let significant = match (close, last_pushed.get(&topic)) {
            (None, _) => rolled,
            (Some(_), None) => true,
            (Some(c), Some(&prev)) => rolled || relative_change(prev, c) >= threshold,
        };
        if significant {
            if let Some(c) = close {
                last_pushed.insert(topic, c);
            }
            picked.push(snap.clone());
        }
    }
    picked
}

fn relative_change(prev: f64, next: f64) -> f64 {
    if prev == 0.0 {
        return if next == 0.0 { 0.0 } else { f64::INFINITY };
    }
    ((next - prev) / prev).abs()
}
