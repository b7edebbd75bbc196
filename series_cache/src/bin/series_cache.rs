use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use series_cache::{
    clock::SystemClock,
    config::{EngineConfig, load_config_path},
    db::migrate,
    providers::OfflineFetcher,
    service::SeriesService,
    store::{BucketStore, SqliteStore},
};
use shared_utils::env::{get_env_var, get_env_var_or, parse_env_var};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Multi-resolution series cache CLI")]
struct Cli {
    /// Engine config (TOML). Falls back to $SERIES_CACHE_CONFIG, then defaults.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply pending schema migrations.
    Migrate,
    /// Serve a series from stored data (upstream offline).
    Query {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1m")]
        resolution: String,
        /// RFC-3339 start (inclusive).
        #[arg(long)]
        start: String,
        /// RFC-3339 end (exclusive).
        #[arg(long)]
        end: String,
    },
    /// Delete buckets past their retention horizon.
    Purge,
}

fn load_config(flag: Option<String>) -> Result<EngineConfig> {
    let path = flag.or_else(|| get_env_var("SERIES_CACHE_CONFIG").ok());
    let mut cfg = match path {
        Some(p) => load_config_path(&p)?,
        None => EngineConfig::default(),
    };
    cfg.database_url = get_env_var_or("SERIES_CACHE_DATABASE_URL", &cfg.database_url);
    if let Some(n) = parse_env_var::<usize>("SERIES_CACHE_MAX_ENTRIES")? {
        cfg.cache.max_entries = n;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn parse_ts(flag: &str, raw: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(raw).with_context(|| format!("--{flag}: bad rfc3339 {raw:?}"))?;
    Ok(dt.with_timezone(&Utc))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config)?;

    match cli.cmd {
        Cmd::Migrate => {
            migrate::run_all(&cfg.database_url)?;
            info!(database = %cfg.database_url, "schema up to date");
        }
        Cmd::Query {
            symbol,
            resolution,
            start,
            end,
        } => {
            let start = parse_ts("start", &start)?;
            let end = parse_ts("end", &end)?;
            let store = Arc::new(SqliteStore::open(&cfg.database_url, cfg.resolution_table()?)?);
            let service =
                SeriesService::from_config(&cfg, store, Arc::new(OfflineFetcher), Arc::new(SystemClock))?;
            let series = service.get_series(&symbol, &resolution, start, end).await?;
            println!("{}", serde_json::to_string_pretty(&series)?);
        }
        Cmd::Purge => {
            let store = SqliteStore::open(&cfg.database_url, cfg.resolution_table()?)?;
            let removed = tokio::task::spawn_blocking(move || store.purge_expired(Utc::now())).await??;
            info!(removed, "purge complete");
        }
    }

    Ok(())
}
