//! Multi-resolution time-series aggregation and caching.
//!
//! Base (1-minute) buckets are persisted in SQLite; every coarser resolution
//! is derived on demand and kept in a bounded recency cache. Watched symbols
//! also get a live view of the still-open window, pushed to subscribers.
//!
//! Main entry points:
//! - [`service::SeriesService`] for historical queries,
//! - [`live::LiveFeed`] for raw event ingestion and live subscriptions,
//! - [`config::load_config_path`] for configuration.

#![warn(missing_docs)]

pub mod aggregate;
pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
/// Error type of the query path.
pub mod errors;
pub mod fanout;
pub mod live;
pub mod models;
pub mod providers;
pub mod resolution;
/// Diesel table definitions.
pub mod schema;
pub mod service;
pub mod session;
pub mod store;
pub mod tracker;
