use std::{sync::Arc, thread};

use chrono::Duration;
use diesel::prelude::*;
use series_cache::{
    bucket::bucket_id,
    db::connection::connect_sqlite,
    models::{Bucket, TimeRange},
    resolution::Resolution,
    schema::buckets,
    store::{
        BucketStore, SeriesKey,
        coverage::compute_missing,
        rows::BucketRow,
    },
};

mod common;
use common::{bar, minute_bars, t};

fn raw_rows(path: &str) -> Vec<BucketRow> {
    let mut conn = connect_sqlite(path).expect("connect");
    buckets::table
        .order(buckets::bucket_start.asc())
        .select(BucketRow::as_select())
        .load(&mut conn)
        .expect("load rows")
}

#[test]
fn store_connection_applies_pragmas() {
    let (db, mut conn) = common::setup_db();
    common::assert_sqlite_pragmas(&mut conn);
    let mut second = connect_sqlite(&db.path).expect("connect second");
    common::assert_sqlite_pragmas(&mut second);
}

#[test]
fn rewriting_identical_data_leaves_rows_byte_identical() {
    let (db, store) = common::setup_store();
    let key = SeriesKey::base("aapl", "test");
    let batch = vec![
        bar(t(14, 30), 100.0).with_sentiment(0.25, 0.8, 4),
        bar(t(14, 31), 101.0),
    ];

    assert_eq!(store.upsert_buckets(&key, &batch).unwrap(), 2);
    let first = raw_rows(&db.path);
    store.upsert_buckets(&key, &batch).unwrap();
    let second = raw_rows(&db.path);

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert_eq!(first[0].symbol, "AAPL");
    assert_eq!(first[0].bucket_start, "2024-01-15T14:30:00.000Z");
    assert_eq!(first[0].item_count, Some(4));
}

#[test]
fn last_write_wins() {
    let (_db, store) = common::setup_store();
    let key = SeriesKey::base("AAPL", "test");
    store.upsert_buckets(&key, &[bar(t(14, 30), 100.0).with_sentiment(0.1, 0.1, 1)]).unwrap();
    store.upsert_buckets(&key, &[bar(t(14, 30), 105.0)]).unwrap();

    let got = store.range(&key, TimeRange::new(t(14, 0), t(15, 0))).unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].close, 105.0);
    // omitted optional fields are cleared, not merged
    assert_eq!(got[0].sentiment_score, None);
}

#[test]
fn range_is_ordered_and_half_open() {
    let (_db, store) = common::setup_store();
    let key = SeriesKey::base("AAPL", "test");
    let mut batch = minute_bars(t(14, 30), t(14, 40));
    batch.reverse();
    store.upsert_buckets(&key, &batch).unwrap();

    let got = store.range(&key, TimeRange::new(t(14, 32), t(14, 35))).unwrap();
    let starts: Vec<_> = got.iter().map(|b| b.bucket_start).collect();
    assert_eq!(starts, vec![t(14, 32), t(14, 33), t(14, 34)]);

    let other = SeriesKey::base("AAPL", "other-source");
    assert!(store.range(&other, TimeRange::new(t(14, 0), t(15, 0))).unwrap().is_empty());
}

#[test]
fn invalid_batch_is_rejected_atomically() {
    let (_db, store) = common::setup_store();
    let key = SeriesKey::base("AAPL", "test");
    let mut bad = bar(t(14, 31), 1.0);
    bad.low = 10.0;
    assert!(store.upsert_buckets(&key, &[bar(t(14, 30), 1.0), bad]).is_err());
    assert!(store.range(&key, TimeRange::new(t(14, 0), t(15, 0))).unwrap().is_empty());
}

#[test]
fn coverage_drives_missing_ranges() {
    let (_db, store) = common::setup_store();
    let key = SeriesKey::base("AAPL", "test");
    let res = Resolution::Minute1;
    store
        .mark_covered(&key, bucket_id(t(10, 0), res)..bucket_id(t(10, 30), res))
        .unwrap();

    let present = store.coverage(&key).unwrap();
    let missing = compute_missing(&present, TimeRange::new(t(9, 50), t(10, 40)), res).unwrap();
    assert_eq!(
        missing,
        vec![
            TimeRange::new(t(9, 50), t(10, 0)),
            TimeRange::new(t(10, 30), t(10, 40)),
        ]
    );
}

#[test]
fn purge_removes_only_expired_rows() {
    let (_db, store) = common::setup_store();
    let base = SeriesKey::base("AAPL", "test");
    let daily = SeriesKey::new("AAPL", "test", Resolution::Day1);
    store.upsert_buckets(&base, &[bar(t(14, 30), 1.0)]).unwrap();
    store
        .upsert_buckets(&daily, &[Bucket::new(t(0, 0), 1.0, 2.0, 0.5, 1.5)])
        .unwrap();

    let retention = store.table().get(Resolution::Minute1).retention;
    let removed = store.purge_expired(t(14, 30) + retention).unwrap();
    assert_eq!(removed, 1);
    assert!(store.range(&base, TimeRange::new(t(0, 0), t(23, 0))).unwrap().is_empty());
    assert_eq!(
        store
            .range(&daily, TimeRange::new(t(0, 0), t(0, 0) + Duration::days(1)))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn concurrent_writers_converge() {
    let (_db, store) = common::setup_store();
    let key = SeriesKey::base("AAPL", "test");
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = Arc::clone(&store);
            let key = key.clone();
            thread::spawn(move || {
                let batch = minute_bars(t(14, 0), t(15, 0))
                    .into_iter()
                    .map(|mut b| {
                        b.volume = Some(i as f64);
                        b
                    })
                    .collect::<Vec<_>>();
                store.upsert_buckets(&key, &batch).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let got = store.range(&key, TimeRange::new(t(14, 0), t(15, 0))).unwrap();
    assert_eq!(got.len(), 60);
    let v = got[0].volume;
    assert!(got.iter().all(|b| b.volume == v), "one writer's batch wins whole");
}
