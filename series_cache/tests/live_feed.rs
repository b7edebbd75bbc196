use std::sync::Arc;

use chrono::Duration;
use series_cache::{
    clock::ManualClock,
    config::{EngineConfig, LiveCfg},
    live::LiveFeed,
    models::{RawEvent, TimeRange},
    resolution::Resolution,
    store::{BucketStore, SeriesKey},
};

mod common;
use common::t;

fn feed(store: Arc<dyn BucketStore>, clock: Arc<ManualClock>) -> Arc<LiveFeed> {
    let settings = LiveCfg {
        push_interval_ms: 1_000,
        significant_change: 0.0,
    };
    Arc::new(LiveFeed::new(store, "primary", clock, settings))
}

#[tokio::test]
async fn rollover_is_persisted_before_the_next_window_is_seen() {
    let (_db, store) = common::setup_store();
    let clock = Arc::new(ManualClock::new(t(14, 30)));
    let feed = feed(store.clone(), clock);
    let mut sub = feed.subscribe("AAPL", Resolution::Minute1);

    for (sec, px) in [(1, 10.0), (20, 12.0), (40, 9.0), (59, 11.0)] {
        feed.ingest(RawEvent::tick("AAPL", t(14, 30) + Duration::seconds(sec), px, Some(1.0)))
            .await
            .unwrap();
    }
    feed.ingest(RawEvent::tick("AAPL", t(14, 31), 11.5, None)).await.unwrap();

    let snap = sub.recv().await.unwrap();
    assert_eq!(snap.window_start, t(14, 31));
    assert_eq!(snap.elapsed_fraction, 0.0);

    let stored = store
        .range(&SeriesKey::base("AAPL", "primary"), TimeRange::new(t(14, 30), t(14, 31)))
        .unwrap();
    assert_eq!(stored.len(), 1);
    let b = &stored[0];
    assert_eq!((b.open, b.high, b.low, b.close), (10.0, 12.0, 9.0, 11.0));
    assert_eq!(b.volume, Some(4.0));
    assert!(!b.is_partial);
}

#[tokio::test]
async fn many_subscribers_under_backpressure_see_latest_in_order() {
    let (_db, store) = common::setup_store();
    let clock = Arc::new(ManualClock::new(t(14, 30)));
    let feed = feed(store, clock);
    let mut subs: Vec<_> = (0..50).map(|_| feed.subscribe("MSFT", Resolution::Minute1)).collect();

    // nobody reads while 3 windows x 20 ticks are published
    for minute in 0..3i64 {
        for tick in 0..20i64 {
            let at = t(14, 30) + Duration::minutes(minute) + Duration::seconds(tick * 3);
            feed.ingest(RawEvent::tick("MSFT", at, 100.0 + tick as f64, None)).await.unwrap();
        }
    }

    for sub in &mut subs {
        let snap = sub.recv().await.unwrap();
        assert_eq!(snap.window_start, t(14, 32));
        assert_eq!(snap.bucket.as_ref().unwrap().close, 119.0);
        assert!(!sub.has_pending());
    }
    assert_eq!(feed.router().subscriber_count(&subs[0].topic().clone()), 50);
    drop(subs);
    assert!(feed.router().topics().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_subscriber_never_holds_back_a_fast_one() {
    let (_db, store) = common::setup_store();
    let clock = Arc::new(ManualClock::new(t(14, 30)));
    let feed = feed(store, clock);
    let slow = feed.subscribe("MSFT", Resolution::Minute1);
    let mut fast = feed.subscribe("MSFT", Resolution::Minute1);
    assert!(fast.recv().await.unwrap().bucket.is_none());

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        while let Some(snap) = fast.recv().await {
            if seen_tx.send(snap.window_start).is_err() {
                break;
            }
        }
    });

    for minute in 0..10i64 {
        let window = t(14, 30) + Duration::minutes(minute);
        feed.ingest(RawEvent::tick("MSFT", window + Duration::seconds(1), 100.0 + minute as f64, None))
            .await
            .unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("fast subscriber stalled")
            .unwrap();
        assert_eq!(got, window);
    }

    // the unread slot holds only the newest snapshot
    assert!(slow.has_pending());
    let latest = slow.latest().unwrap();
    assert_eq!(latest.window_start, t(14, 39));
    assert_eq!(latest.bucket.as_ref().unwrap().close, 109.0);

    reader.abort();
}

#[tokio::test]
async fn live_closes_count_as_coverage_for_queries() {
    let cfg = EngineConfig::default();
    let h = common::harness(cfg.clone(), vec![], t(14, 30));
    let feed = Arc::new(LiveFeed::new(h.store.clone(), &cfg.source, h.clock.clone(), cfg.live.clone()));
    feed.watch("AAPL", Resolution::Minute1);

    for m in 0..5u32 {
        h.clock.set(t(14, 30 + m));
        feed.ingest(RawEvent::tick("AAPL", t(14, 30 + m), 100.0 + m as f64, None))
            .await
            .unwrap();
    }
    h.clock.set(t(14, 35) + Duration::seconds(5));
    feed.sweep().await.unwrap();

    // 09:35 in New York; the closed minutes come from the live feed
    let s = h.service.get_series("AAPL", "5m", t(14, 30), t(14, 35)).await.unwrap();
    assert_eq!(h.fetcher.calls(), 0);
    assert_eq!(s.buckets.len(), 1);
    assert_eq!((s.buckets[0].open, s.buckets[0].close), (100.0, 104.0));
}
