pub mod cache;
pub mod config;
pub mod error;
pub mod funding;
pub mod gaps;
pub mod interval;
pub mod manager;
pub mod okx;
pub mod orchestrator;
pub mod query;
pub mod rest;
pub mod schema;
pub mod table;
pub mod validate;
pub mod vision;

pub use cache::{CacheStats, CacheStore};
pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind};
pub use interval::Interval;
pub use manager::DataManager;
pub use query::{ChartType, FetchOptions, MarketType, Provider, SeriesKey, SourcePolicy};
pub use table::{DataSource, FundingTable, KlineTable, Table};

use clap::Parser;
use std::path::PathBuf;

/// CLI args for one fetch.
#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about = "Fetch OHLCV or funding-rate history through the cache/archive/REST engine"
)]
pub struct FetchArgs {
    /// Trading symbol (e.g. BTCUSDT, or BTC-USDT for OKX)
    #[arg(long)]
    pub symbol: String,

    /// Bar width (1s, 1m, 3m, ..., 1d, 1w, 1M)
    #[arg(long, default_value = "1m")]
    pub interval: String,

    /// Range start, YYYY-MM-DD or RFC 3339
    #[arg(long)]
    pub start: String,

    /// Range end (inclusive), YYYY-MM-DD or RFC 3339; defaults to now
    #[arg(long)]
    pub end: Option<String>,

    /// Data provider (binance, okx)
    #[arg(long, default_value = "binance")]
    pub provider: String,

    /// Market segment (spot, futures_usdt, futures_coin)
    #[arg(long, default_value = "spot")]
    pub market: String,

    /// Chart type (klines, funding_rate)
    #[arg(long, default_value = "klines")]
    pub chart: String,

    /// Pin the fetch to one source (auto, cache, vision, rest)
    #[arg(long, default_value = "auto")]
    pub source: String,

    /// Disable cache reads and writes for this fetch
    #[arg(long)]
    pub no_cache: bool,

    /// Keep the per-row data-source column in the output
    #[arg(long)]
    pub with_source_column: bool,

    /// Write CSV here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// CLI args for cache inspection.
#[derive(Parser, Debug, Clone)]
#[command(about = "Summarize the on-disk day-shard cache")]
pub struct CacheStatsArgs {
    /// Cache root to inspect (defaults to CACHE_ROOT or ./cache)
    #[arg(long)]
    pub root: Option<PathBuf>,
}
