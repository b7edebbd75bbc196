//! Embedded schema migrations.

use anyhow::{Context, anyhow};
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::info;

use super::sqlite_path;

/// Embedded Diesel migrations bundled with this crate.
///
/// These are applied by [`run_sqlite`] to bring the database schema up to date.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending Diesel migrations on a SQLite database at the given path or URL.
///
/// Switches the journal to WAL first, then applies all embedded migrations.
pub fn run_sqlite(url: &str) -> anyhow::Result<()> {
    let path = sqlite_path(url);
    let mut conn = SqliteConnection::establish(path)
        .with_context(|| format!("open sqlite database {path}"))?;
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!(e))?;
    if !applied.is_empty() {
        info!(database = path, applied = applied.len(), "applied migrations");
    }
    Ok(())
}

/// Runs pending migrations for the given database URL.
///
/// Only SQLite is supported; PostgreSQL URLs are rejected with an error
/// instead of being mistaken for a file path.
pub fn run_all(database_url: &str) -> anyhow::Result<()> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        anyhow::bail!("Unsupported DATABASE_URL (sqlite only): {database_url}");
    }
    run_sqlite(database_url)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migrations_apply_on_temp_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_string_lossy().to_string();

        run_sqlite(&path).expect("migration run");
        // second run is a no-op
        run_sqlite(&path).expect("migration rerun");

        let mut conn = SqliteConnection::establish(&path).unwrap();
        conn.batch_execute(
            "INSERT INTO buckets (symbol, source, resolution, bucket_start, open, high, low, close, expires_at) \
             VALUES ('AAPL', 'test', '1m', '2024-01-15T14:30:00.000Z', 1, 2, 0.5, 1.5, '2025-01-15T14:30:00.000Z')",
        )
        .unwrap();
    }

    #[test]
    fn postgres_urls_are_rejected() {
        assert!(run_all("postgres://localhost/series").is_err());
    }
}
