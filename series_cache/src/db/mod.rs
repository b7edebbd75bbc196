//! Database utilities for connections and schema migrations.
//!
//! This module provides:
//! - SQLite connection helpers: [`connection::connect_sqlite`] applies WAL, foreign_keys=ON,
//!   and a 5000ms busy_timeout.
//! - Embedded Diesel migrations: [`migrate::run_sqlite`] and [`migrate::run_all`], which
//!   accepts bare file paths as well as `sqlite:`/`sqlite://` URLs.
//!
//! Example:
//! ```no_run
//! use series_cache::db::{connection, migrate};
//!
//! let db_path = std::env::temp_dir().join("series_cache_example.db");
//! migrate::run_all(db_path.to_str().unwrap()).expect("migrations");
//!
//! let _conn = connection::connect_sqlite(db_path.to_str().unwrap()).expect("connect");
//! ```

pub mod connection;
pub mod migrate;

/// Strip an optional `sqlite:` / `sqlite://` scheme so Diesel gets a path.
pub fn sqlite_path(database_url: &str) -> &str {
    database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url)
}
