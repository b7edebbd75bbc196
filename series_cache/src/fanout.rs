//! Topic-based fan-out of live snapshots.
//!
//! Every subscriber owns a `tokio::sync::watch` slot: a capacity-one queue
//! that always holds the newest value. Publishing overwrites the slot, so a
//! slow subscriber skips intermediate snapshots instead of growing a backlog,
//! and `publish` never waits on anyone.
//!
//! A snapshot is wrapped in one `Arc` per publish and shared by all
//! subscribers of the topic. Per topic, snapshots from an older window than
//! the last published one are discarded.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::tracker::{PartialSnapshot, Topic};

type Slot = watch::Sender<Option<Arc<PartialSnapshot>>>;

#[derive(Default)]
struct TopicState {
    subscribers: HashMap<u64, Slot>,
    latest: Option<Arc<PartialSnapshot>>,
}

#[derive(Default)]
struct RouterInner {
    topics: Mutex<HashMap<Topic, TopicState>>,
    next_id: AtomicU64,
}

impl RouterInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<Topic, TopicState>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, topic: &Topic, id: u64) -> bool {
        let mut topics = self.lock();
        let Some(state) = topics.get_mut(topic) else {
            return false;
        };
        let removed = state.subscribers.remove(&id).is_some();
        if removed {
            debug!(topic = %topic, id, remaining = state.subscribers.len(), "subscriber removed");
        }
        removed
    }
}

/// Routes snapshots to the subscribers of their topic. Cheap to clone.
#[derive(Clone, Default)]
pub struct FanoutRouter {
    inner: Arc<RouterInner>,
}

impl FanoutRouter {
    /// Router with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic`. If the topic already has a snapshot, the new
    /// subscription receives it right away.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        {
            let mut topics = self.inner.lock();
            let state = topics.entry(topic.clone()).or_default();
            if let Some(latest) = &state.latest {
                tx.send_replace(Some(Arc::clone(latest)));
            }
            state.subscribers.insert(id, tx);
            debug!(topic = %topic, id, subscribers = state.subscribers.len(), "subscribed");
        }
        Subscription {
            id,
            topic,
            rx,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Remove subscription `id` from `topic`. Returns false if it was already
    /// gone.
    pub fn unsubscribe(&self, topic: &Topic, id: u64) -> bool {
        self.inner.remove(topic, id)
    }

    /// Deliver `snapshot` to every subscriber of its topic. Returns how many
    /// subscribers it reached (0 when it was older than the last one).
    pub fn publish(&self, snapshot: PartialSnapshot) -> usize {
        let topic = snapshot.topic();
        let snapshot = Arc::new(snapshot);
        let mut topics = self.inner.lock();
        let state = topics.entry(topic).or_default();
        if let Some(prev) = &state.latest {
            let older = snapshot.window_index < prev.window_index
                || (snapshot.window_index == prev.window_index
                    && snapshot.elapsed_fraction < prev.elapsed_fraction);
            if older {
                trace!(
                    symbol = %snapshot.symbol,
                    window = snapshot.window_index,
                    latest = prev.window_index,
                    elapsed = snapshot.elapsed_fraction,
                    "stale snapshot dropped"
                );
                return 0;
            }
        }
        state.latest = Some(Arc::clone(&snapshot));
        state.subscribers.retain(|id, tx| {
            if tx.is_closed() {
                debug!(symbol = %snapshot.symbol, id, "dropping closed subscriber");
                return false;
            }
            tx.send_replace(Some(Arc::clone(&snapshot)));
            true
        });
        state.subscribers.len()
    }

    /// Forget `topic`: its subscribers see the end of their stream.
    pub fn close_topic(&self, topic: &Topic) -> usize {
        let removed = self.inner.lock().remove(topic);
        removed.map_or(0, |s| s.subscribers.len())
    }

    /// Number of live subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .lock()
            .get(topic)
            .map_or(0, |s| s.subscribers.len())
    }

    /// Topics with at least one subscriber.
    pub fn topics(&self) -> Vec<Topic> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, s)| !s.subscribers.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: watch::Receiver<Option<Arc<PartialSnapshot>>>,
    router: Weak<RouterInner>,
}

impl Subscription {
    /// Identifier for [`FanoutRouter::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribed topic.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait for the next snapshot. Only the newest pending snapshot is
    /// returned; `None` once the subscription has been removed.
    pub async fn recv(&mut self) -> Option<Arc<PartialSnapshot>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(snap) = self.rx.borrow_and_update().clone() {
                return Some(snap);
            }
        }
    }

    /// True when a snapshot is waiting.
    pub fn has_pending(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Most recent snapshot delivered to this slot, without waiting.
    pub fn latest(&self) -> Option<Arc<PartialSnapshot>> {
        self.rx.borrow().clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.remove(&self.topic, self.id);
        }
    }
}
