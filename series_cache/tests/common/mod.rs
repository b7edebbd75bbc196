#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use diesel::{QueryableByName, prelude::*, sql_types::{Integer, Text}};
use series_cache::{
    clock::ManualClock,
    config::{EngineConfig, ResolutionTable},
    db::{connection, migrate},
    models::{Bucket, TimeRange},
    providers::{BaseBucketFetcher, FetchError},
    service::SeriesService,
    store::SqliteStore,
};
use tempfile::TempDir;

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();

    migrate::run_all(&path).expect("migrations");
    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn setup_store() -> (TestDb, Arc<SqliteStore>) {
    let (db, _conn) = setup_db();
    let store = SqliteStore::open(&db.path, ResolutionTable::defaults()).expect("open store");
    (db, Arc::new(store))
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal");

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

/// 2024-01-15 (a Monday) at `h:m` UTC.
pub fn t(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
}

/// Flat-ish one-minute bar closing at `close`.
pub fn bar(at: DateTime<Utc>, close: f64) -> Bucket {
    Bucket::new(at, close, close + 0.5, close - 0.5, close).with_volume(100.0)
}

/// One bar per minute over `[start, end)`, closes counting up from 100.
pub fn minute_bars(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Bucket> {
    let mut out = Vec::new();
    let mut at = start;
    let mut close = 100.0;
    while at < end {
        out.push(bar(at, close));
        at += Duration::minutes(1);
        close += 1.0;
    }
    out
}

/// Upstream stand-in serving canned base bars and recording every call.
#[derive(Default)]
pub struct CountingFetcher {
    data: Mutex<Vec<Bucket>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<TimeRange>>,
    failing: AtomicBool,
}

impl CountingFetcher {
    pub fn with_data(data: Vec<Bucket>) -> Arc<Self> {
        let f = Self::default();
        *f.data.lock().unwrap() = data;
        Arc::new(f)
    }

    pub fn set_data(&self, data: Vec<Bucket>) {
        *self.data.lock().unwrap() = data;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<TimeRange> {
        self.requested.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BaseBucketFetcher for CountingFetcher {
    async fn fetch_base_buckets(
        &self,
        _symbol: &str,
        _source: &str,
        range: TimeRange,
    ) -> Result<Vec<Bucket>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(range);
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable("connection refused".to_string()));
        }
        Ok(self
            .data
            .lock()
            .unwrap()
            .iter()
            .filter(|b| range.contains(b.bucket_start))
            .cloned()
            .collect())
    }
}

pub struct Harness {
    pub db: TestDb,
    pub store: Arc<SqliteStore>,
    pub fetcher: Arc<CountingFetcher>,
    pub clock: Arc<ManualClock>,
    pub service: SeriesService,
}

/// Service over a temp store, with `now` on the manual clock.
pub fn harness(cfg: EngineConfig, data: Vec<Bucket>, now: DateTime<Utc>) -> Harness {
    let (db, store) = setup_store();
    let fetcher = CountingFetcher::with_data(data);
    let clock = Arc::new(ManualClock::new(now));
    let service =
        SeriesService::from_config(&cfg, store.clone(), fetcher.clone(), clock.clone()).expect("service");
    Harness {
        db,
        store,
        fetcher,
        clock,
        service,
    }
}
