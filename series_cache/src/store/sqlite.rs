//! Diesel/SQLite implementation of [`BucketStore`].
//!
//! A single connection guarded by a mutex serves every caller. Writes run in
//! `BEGIN IMMEDIATE` transactions so a batch upsert is all-or-nothing and
//! concurrent readers (WAL) never observe half a batch.

use std::{ops::Range, sync::Mutex};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use diesel::{Connection, SqliteConnection, prelude::*};
use diesel_migrations::MigrationHarness;
use roaring::RoaringBitmap;
use tracing::{debug, info};

use super::{
    BucketStore, SeriesKey, StoreError, StoreResult,
    coverage::{coverage_from_bytes, coverage_to_bytes, id_range_u32, retention_floor},
    rows::{BucketRow, to_rfc3339_millis},
};
use crate::{
    bucket,
    config::ResolutionTable,
    db::{connection::connect_sqlite, migrate},
    models::{Bucket, TimeRange},
    resolution::Resolution,
    schema::{bucket_coverage, buckets},
};

/// SQLite-backed bucket store.
pub struct SqliteStore {
    conn: Mutex<SqliteConnection>,
    table: ResolutionTable,
}

impl SqliteStore {
    /// Migrate `database_url` to the latest schema and open it.
    pub fn open(database_url: &str, table: ResolutionTable) -> anyhow::Result<Self> {
        migrate::run_all(database_url)?;
        let conn = connect_sqlite(database_url)?;
        info!(database = database_url, "opened bucket store");
        Ok(Self::from_connection(conn, table))
    }

    /// A private in-memory database, migrated.
    pub fn open_in_memory(table: ResolutionTable) -> anyhow::Result<Self> {
        let mut conn = SqliteConnection::establish(":memory:")?;
        conn.run_pending_migrations(migrate::MIGRATIONS)
            .map_err(|e| anyhow!(e))?;
        Ok(Self::from_connection(conn, table))
    }

    /// Wrap an already migrated connection.
    pub fn from_connection(conn: SqliteConnection, table: ResolutionTable) -> Self {
        Self {
            conn: Mutex::new(conn),
            table,
        }
    }

    /// Retention/TTL table this store was opened with.
    pub fn table(&self) -> &ResolutionTable {
        &self.table
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut SqliteConnection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut guard)
    }

    fn validate(key: &SeriesKey, b: &Bucket) -> StoreResult<()> {
        if !bucket::is_aligned(b.bucket_start, key.resolution) {
            return Err(StoreError::InvalidBucket {
                bucket_start: b.bucket_start,
                reason: "start is not aligned to the resolution",
            });
        }
        if !b.is_consistent() {
            return Err(StoreError::InvalidBucket {
                bucket_start: b.bucket_start,
                reason: "OHLC values are not consistent",
            });
        }
        Ok(())
    }
}

impl BucketStore for SqliteStore {
    fn upsert_buckets(&self, key: &SeriesKey, batch: &[Bucket]) -> StoreResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let retention = self.table.get(key.resolution).retention;
        let rows = batch
            .iter()
            .map(|b| {
                Self::validate(key, b)?;
                Ok(BucketRow::from_bucket(key, b, b.bucket_start + retention))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let written = self.with_conn(|conn| {
            conn.immediate_transaction(|conn| {
                use crate::schema::buckets::dsl::*;
                let mut n = 0;
                for row in &rows {
                    n += diesel::insert_into(buckets)
                        .values(row)
                        .on_conflict((symbol, source, resolution, bucket_start))
                        .do_update()
                        .set(row)
                        .execute(conn)?;
                }
                Ok::<_, StoreError>(n)
            })
        })?;
        debug!(symbol = %key.symbol, resolution = %key.resolution, written, "upserted buckets");
        Ok(written)
    }

    fn range(&self, key: &SeriesKey, window: TimeRange) -> StoreResult<Vec<Bucket>> {
        if window.is_empty() {
            return Ok(vec![]);
        }
        let start = to_rfc3339_millis(window.start);
        let end = to_rfc3339_millis(window.end);
        let rows = self.with_conn(|conn| {
            use crate::schema::buckets::dsl::*;
            Ok(buckets
                .filter(symbol.eq(&key.symbol))
                .filter(source.eq(&key.source))
                .filter(resolution.eq(key.resolution.label()))
                .filter(bucket_start.ge(&start))
                .filter(bucket_start.lt(&end))
                .order(bucket_start.asc())
                .select(BucketRow::as_select())
                .load::<BucketRow>(conn)?)
        })?;
        rows.into_iter().map(BucketRow::into_bucket).collect()
    }

    fn coverage(&self, key: &SeriesKey) -> StoreResult<RoaringBitmap> {
        let bytes = self.with_conn(|conn| {
            use crate::schema::bucket_coverage::dsl::*;
            Ok(bucket_coverage
                .filter(symbol.eq(&key.symbol))
                .filter(source.eq(&key.source))
                .filter(resolution.eq(key.resolution.label()))
                .select(bitmap)
                .first::<Vec<u8>>(conn)
                .optional()?)
        })?;
        match bytes {
            Some(b) => coverage_from_bytes(&b),
            None => Ok(RoaringBitmap::new()),
        }
    }

    fn mark_covered(&self, key: &SeriesKey, ids: Range<u64>) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids32 = id_range_u32(ids)?;
        self.with_conn(|conn| {
            conn.immediate_transaction(|conn| {
                use crate::schema::bucket_coverage::dsl::*;
                let existing = bucket_coverage
                    .filter(symbol.eq(&key.symbol))
                    .filter(source.eq(&key.source))
                    .filter(resolution.eq(key.resolution.label()))
                    .select(bitmap)
                    .first::<Vec<u8>>(conn)
                    .optional()?;
                let existed = existing.is_some();
                let mut rb = match existing {
                    Some(b) => coverage_from_bytes(&b)?,
                    None => RoaringBitmap::new(),
                };
                if rb.insert_range(ids32) == 0 && existed {
                    return Ok(());
                }
                let bytes = coverage_to_bytes(&rb)?;
                diesel::insert_into(bucket_coverage)
                    .values((
                        symbol.eq(&key.symbol),
                        source.eq(&key.source),
                        resolution.eq(key.resolution.label()),
                        bitmap.eq(bytes.as_slice()),
                        version.eq(0),
                    ))
                    .on_conflict((symbol, source, resolution))
                    .do_update()
                    .set((bitmap.eq(bytes.as_slice()), version.eq(version + 1)))
                    .execute(conn)?;
                Ok::<_, StoreError>(())
            })
        })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = to_rfc3339_millis(now);
        let removed = self.with_conn(|conn| {
            conn.immediate_transaction(|conn| {
                let removed = diesel::delete(
                    buckets::table.filter(buckets::expires_at.le(&cutoff)),
                )
                .execute(conn)?;

                // drop coverage below the retention horizon so expired ranges
                // are fetched again instead of served as empty
                let rows = bucket_coverage::table
                    .select((
                        bucket_coverage::symbol,
                        bucket_coverage::source,
                        bucket_coverage::resolution,
                        bucket_coverage::bitmap,
                    ))
                    .load::<(String, String, String, Vec<u8>)>(conn)?;
                for (sym, src, label, bytes) in rows {
                    let res: Resolution = label
                        .parse()
                        .map_err(|_| StoreError::Corrupt(format!("bad resolution {label:?}")))?;
                    let floor = retention_floor(now, self.table.get(res).retention, res);
                    let floor = u32::try_from(floor).unwrap_or(u32::MAX);
                    let mut rb = coverage_from_bytes(&bytes)?;
                    if rb.remove_range(0..floor) == 0 {
                        continue;
                    }
                    diesel::update(
                        bucket_coverage::table
                            .filter(bucket_coverage::symbol.eq(&sym))
                            .filter(bucket_coverage::source.eq(&src))
                            .filter(bucket_coverage::resolution.eq(&label)),
                    )
                    .set((
                        bucket_coverage::bitmap.eq(coverage_to_bytes(&rb)?),
                        bucket_coverage::version.eq(bucket_coverage::version + 1),
                    ))
                    .execute(conn)?;
                }
                Ok::<_, StoreError>(removed)
            })
        })?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "purged expired buckets");
        }
        Ok(removed)
    }
}
