use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crypto_market_data::interval::MICROS_PER_DAY;
use crypto_market_data::schema::{FUNDING_COLUMNS, KLINE_COLUMNS};
use crypto_market_data::{
    CacheStatsArgs, CacheStore, ChartType, DataManager, EngineConfig, FetchArgs, FetchOptions,
    Interval, MarketType, Provider, SourcePolicy, Table, interval::day_start_micros,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a bar range and emit it as CSV
    Fetch(FetchArgs),
    /// Summarize the on-disk cache
    CacheStats(CacheStatsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let args = Args::parse();
    match args.command {
        Command::Fetch(fetch_args) => run_fetch(fetch_args).await,
        Command::CacheStats(stats_args) => run_cache_stats(&stats_args),
    }
}

/// LOG_LEVEL picks the verbosity floor, LOG_FILE redirects the sink to an
/// append-mode file, DISABLE_COLORS strips ANSI. RUST_LOG still wins when
/// set.
fn init_logging() -> Result<()> {
    let level = std::env::var("LOG_LEVEL")
        .map(|v| map_log_level(&v))
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let ansi = std::env::var("DISABLE_COLORS").is_err();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {path}"))?;
        builder.with_ansi(false).with_writer(Arc::new(file)).init();
    } else {
        builder.with_ansi(ansi).init();
    }
    Ok(())
}

fn map_log_level(raw: &str) -> &'static str {
    match raw.to_uppercase().as_str() {
        "CRITICAL" | "ERROR" => "error",
        "WARNING" => "warn",
        "DEBUG" => "debug",
        _ => "info",
    }
}

async fn run_fetch(args: FetchArgs) -> Result<()> {
    let provider: Provider = args.provider.parse()?;
    let market: MarketType = args.market.parse()?;
    let chart: ChartType = args.chart.parse()?;
    let interval: Interval = args.interval.parse()?;
    let source: SourcePolicy = args.source.parse()?;
    let start = parse_time_micros(&args.start, false).context("invalid --start")?;
    let end = match &args.end {
        Some(raw) => parse_time_micros(raw, true).context("invalid --end")?,
        None => Utc::now().timestamp_micros(),
    };
    if end < start {
        bail!("--end precedes --start");
    }

    let mut config = EngineConfig::from_env();
    if args.no_cache {
        config.enable_cache = false;
    }
    let opts = FetchOptions {
        use_cache: !args.no_cache,
        enforce_source: source,
        include_source_metadata: args.with_source_column,
    };

    let manager = DataManager::new(provider, market, chart, config)?;
    let table = manager
        .get_data(&args.symbol, start, end, interval, &opts)
        .await?;
    write_csv(&table, args.out.as_deref())?;

    let stats = manager.cache_stats();
    info!(
        rows = table.len(),
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        "fetch complete"
    );
    manager.close();
    Ok(())
}

fn run_cache_stats(args: &CacheStatsArgs) -> Result<()> {
    let root = args
        .root
        .clone()
        .or_else(|| std::env::var("CACHE_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./cache"));
    let store = CacheStore::open(&root)?;
    let (shards, bytes, rows) = store.shard_summary();
    println!("cache root: {}", root.display());
    println!("day shards: {shards}");
    println!("rows:       {rows}");
    println!("bytes:      {bytes}");
    Ok(())
}

/// Accept `YYYY-MM-DD` (day start, or day end when `end_of_day`) or a
/// full RFC 3339 timestamp.
fn parse_time_micros(raw: &str, end_of_day: bool) -> Result<i64> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let start = day_start_micros(date);
        return Ok(if end_of_day {
            start + MICROS_PER_DAY - 1
        } else {
            start
        });
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_micros());
    }
    bail!("expected YYYY-MM-DD or RFC 3339, got {raw:?}")
}

fn write_csv(table: &Table, out: Option<&std::path::Path>) -> Result<()> {
    let sink: Box<dyn io::Write> = match out {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let mut writer = csv::Writer::from_writer(sink);
    match table {
        Table::Klines(t) => {
            let mut header: Vec<&str> = KLINE_COLUMNS.to_vec();
            if t.source.is_some() {
                header.push("_data_source");
            }
            writer.write_record(&header)?;
            for i in 0..t.len() {
                let mut record = vec![
                    t.open_time[i].to_string(),
                    format!("{:.8}", t.open[i]),
                    format!("{:.8}", t.high[i]),
                    format!("{:.8}", t.low[i]),
                    format!("{:.8}", t.close[i]),
                    format!("{:.8}", t.volume[i]),
                    t.close_time[i].to_string(),
                    format!("{:.8}", t.quote_asset_volume[i]),
                    t.count[i].to_string(),
                    format!("{:.8}", t.taker_buy_volume[i]),
                    format!("{:.8}", t.taker_buy_quote_volume[i]),
                    format!("{:.8}", t.ignore[i]),
                ];
                if let Some(source) = &t.source {
                    record.push(source[i].as_str().to_string());
                }
                writer.write_record(&record)?;
            }
        }
        Table::Funding(t) => {
            let mut header: Vec<&str> = FUNDING_COLUMNS.to_vec();
            if t.source.is_some() {
                header.push("_data_source");
            }
            writer.write_record(&header)?;
            for i in 0..t.len() {
                let mut record = vec![
                    t.funding_time[i].to_string(),
                    t.symbol[i].clone(),
                    format!("{:.8}", t.funding_rate[i]),
                    format!("{:.8}", t.mark_price[i]),
                ];
                if let Some(source) = &t.source {
                    record.push(source[i].as_str().to_string());
                }
                writer.write_record(&record)?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}
