//! Funding-rate retrieval: a single-endpoint REST client per futures
//! segment that dispatches cadence-sized windows concurrently under the
//! funding cap, plus the cache-integrated flow that mirrors the kline
//! composition (no archive path exists for funding data).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::config::{EngineConfig, binance_funding_path, rest_endpoints};
use crate::error::{EngineError, ErrorKind, Result, SourceAttempt};
use crate::query::{FetchOptions, MarketType, Provider, SeriesKey, SourcePolicy};
use crate::rest::{
    EndpointRotation, FetchStats, RequestPolicy, RetryCounters, TimeoutIncident,
    get_json_with_retry,
};
use crate::table::{DataSource, FundingRow, FundingTable, Table};
use crate::validate;

pub const FUNDING_PAGE_LIMIT: usize = 1000;

/// Binance settles funding every 8 hours; windows are sized so one page
/// covers a whole window at that cadence. Denser series spill onto
/// follow-up pages inside the window.
const FUNDING_CADENCE_MICROS: i64 = 8 * 3_600 * 1_000_000;

/// Partition `[start, end]` into inclusive windows whose expected record
/// count fits one page. Successive windows are half-open neighbors, like
/// the kline chunker.
fn funding_windows(start: i64, end: i64) -> Vec<(i64, i64)> {
    let span = FUNDING_PAGE_LIMIT as i64 * FUNDING_CADENCE_MICROS;
    let mut windows = Vec::new();
    let mut ws = start;
    while ws <= end {
        let we = (ws + span - 1).min(end);
        windows.push((ws, we));
        ws = we + 1;
    }
    windows
}

pub struct FundingRateClient {
    http: reqwest::Client,
    rotation: Arc<EndpointRotation>,
    path: &'static str,
    config: EngineConfig,
}

impl FundingRateClient {
    pub fn new(http: reqwest::Client, market: MarketType, config: EngineConfig) -> Self {
        FundingRateClient {
            http,
            rotation: Arc::new(EndpointRotation::new(rest_endpoints(
                Provider::Binance,
                market,
            ))),
            path: binance_funding_path(market),
            config,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.rotation = Arc::new(EndpointRotation::new(endpoints));
        self
    }

    /// Fetch `[start, end]` as cadence-sized windows dispatched
    /// concurrently under the funding cap, with the same retry, rotation
    /// and deadline rules as the kline engine. Each window pages forward
    /// when the series is denser than the assumed cadence.
    pub async fn fetch(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
        cancel: &CancellationToken,
    ) -> Result<(FundingTable, FetchStats)> {
        let started = Instant::now();
        let mut stats = FetchStats::default();
        if end < start {
            return Ok((FundingTable::new(), stats));
        }
        let policy = RequestPolicy {
            fetch_timeout: self.config.fetch_timeout,
            max_retries: self.config.max_retries,
        };
        let counters = Arc::new(RetryCounters::default());
        let windows = funding_windows(start, end);
        stats.chunk_count = windows.len();
        let semaphore = Arc::new(Semaphore::new(self.config.funding_concurrency.max(1)));

        let mut join: JoinSet<(i64, i64, Result<FundingTable>)> = JoinSet::new();
        for (ws, we) in windows {
            let http = self.http.clone();
            let rotation = self.rotation.clone();
            let semaphore = semaphore.clone();
            let counters = counters.clone();
            let path = self.path;
            let symbol = key.symbol.clone();
            join.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result =
                    fetch_window(&http, &rotation, path, policy, &counters, &symbol, ws, we)
                        .await;
                (ws, we, result)
            });
        }

        let deadline = sleep(self.config.whole_fetch_deadline());
        tokio::pin!(deadline);
        let mut tables = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join.abort_all();
                    stats.cancelled = true;
                    debug!(symbol = %key.symbol, "funding fetch cancelled by caller");
                    break;
                }
                _ = &mut deadline => {
                    join.abort_all();
                    stats.timed_out = true;
                    let incident = TimeoutIncident {
                        operation: "funding_fetch",
                        duration: started.elapsed(),
                        symbol: key.symbol.clone(),
                        interval: key.interval.code().to_string(),
                        start,
                        end,
                        chunk_count: stats.chunk_count,
                        completed_chunks: stats.completed_chunks,
                    };
                    warn!(
                        target: "timeouts",
                        operation = incident.operation,
                        duration_ms = incident.duration.as_millis() as u64,
                        symbol = %incident.symbol,
                        chunk_count = incident.chunk_count,
                        completed_chunks = incident.completed_chunks,
                        "funding fetch deadline expired, returning completed windows"
                    );
                    stats.timeout_incident = Some(incident);
                    break;
                }
                next = join.join_next() => {
                    match next {
                        None => break,
                        Some(Ok((_, _, Ok(table)))) => {
                            stats.completed_chunks += 1;
                            tables.push(table);
                        }
                        Some(Ok((ws, we, Err(err)))) => {
                            err.emit();
                            stats.failed_ranges.push((ws, we));
                            stats.chunk_errors.push(err);
                        }
                        Some(Err(join_err)) => {
                            if !join_err.is_cancelled() {
                                warn!(error = %join_err, "funding window task panicked");
                            }
                        }
                    }
                }
            }
        }
        drop(join);

        stats.retries = counters.retries.load(Ordering::Relaxed);
        stats.rate_limited = counters.rate_limited.load(Ordering::Relaxed);
        let merged = FundingTable::merge(tables);
        stats.elapsed = started.elapsed();
        Ok((merged, stats))
    }
}

/// Walk one window forward page by page. The cursor advances one
/// millisecond past the last row whenever a page comes back full, so
/// series denser than the assumed cadence are drained completely.
async fn fetch_window(
    http: &reqwest::Client,
    rotation: &EndpointRotation,
    path: &str,
    policy: RequestPolicy,
    counters: &RetryCounters,
    symbol: &str,
    window_start: i64,
    window_end: i64,
) -> Result<FundingTable> {
    let end_ms = window_end / 1_000;
    let mut cursor_ms = window_start / 1_000;
    let mut table = FundingTable::new();
    while cursor_ms <= end_ms {
        let query = format!(
            "{path}?symbol={symbol}&startTime={cursor_ms}&endTime={end_ms}&limit={FUNDING_PAGE_LIMIT}"
        );
        let value = match get_json_with_retry(http, rotation, &query, policy, counters).await {
            Ok(value) => value,
            Err(err) if err.kind == ErrorKind::ResourceNotFound => break,
            Err(err) => {
                return Err(err
                    .with("symbol", symbol)
                    .with("window_start", window_start)
                    .with("window_end", window_end));
            }
        };
        let rows = parse_funding_page(&value)?;
        let page_len = rows.len();
        let last_time = rows.last().map(|r| r.funding_time);
        for row in rows {
            if row.funding_time >= window_start && row.funding_time <= window_end {
                table.push(row);
            }
        }
        match last_time {
            Some(last) if page_len >= FUNDING_PAGE_LIMIT => {
                cursor_ms = last / 1_000 + 1;
            }
            _ => break,
        }
    }
    Ok(table)
}

/// Parse one funding page: an array of `{symbol, fundingTime,
/// fundingRate, markPrice}` objects with millisecond timestamps.
fn parse_funding_page(value: &serde_json::Value) -> Result<Vec<FundingRow>> {
    let entries = value.as_array().ok_or_else(|| {
        EngineError::new(ErrorKind::ProtocolFormat, "funding response is not an array")
    })?;
    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let funding_time_ms = entry
            .get("fundingTime")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                EngineError::new(ErrorKind::ProtocolFormat, "funding entry lacks fundingTime")
            })?;
        let symbol = entry
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let funding_rate = entry
            .get("fundingRate")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| {
                EngineError::new(ErrorKind::ProtocolFormat, "funding entry lacks fundingRate")
            })?;
        let mark_price = entry
            .get("markPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .unwrap_or(f64::NAN);
        rows.push(FundingRow {
            funding_time: funding_time_ms * 1_000,
            symbol,
            funding_rate,
            mark_price,
        });
    }
    Ok(rows)
}

/// Cache-composed funding retrieval: probe, fill day gaps over REST,
/// merge with cache precedence, persist, validate.
pub async fn get_funding(
    cache: Option<&CacheStore>,
    client: &FundingRateClient,
    key: &SeriesKey,
    start: i64,
    end: i64,
    opts: &FetchOptions,
    cancel: &CancellationToken,
) -> Result<FundingTable> {
    key.validate()?;
    if matches!(opts.enforce_source, SourcePolicy::Vision) {
        return Err(EngineError::new(
            ErrorKind::InvalidRequest,
            "funding rates have no archive source",
        ));
    }
    if matches!(opts.enforce_source, SourcePolicy::Cache) && !opts.use_cache {
        return Err(EngineError::new(
            ErrorKind::InvalidRequest,
            "cache-only fetch with the cache disabled",
        ));
    }
    if end < start {
        return Err(EngineError::new(
            ErrorKind::InvalidRequest,
            "funding range end precedes start",
        )
        .with("start", start)
        .with("end", end));
    }

    let use_cache = opts.use_cache && cache.is_some();
    let mut attempts: Vec<SourceAttempt> = Vec::new();
    let (mut cached, gaps) = match (use_cache, opts.enforce_source) {
        (true, SourcePolicy::Auto | SourcePolicy::Cache) => {
            let store = cache.ok_or_else(|| {
                EngineError::new(ErrorKind::InvalidRequest, "cache store unavailable")
            })?;
            let (table, gaps) = store.probe(key, start, end)?;
            (table.into_funding()?, gaps)
        }
        _ => (FundingTable::new(), vec![(start, end)]),
    };
    cached.tag_source(DataSource::Cache);

    let mut fetched: Vec<FundingTable> = Vec::new();
    if !matches!(opts.enforce_source, SourcePolicy::Cache) {
        for (a, b) in &gaps {
            match client.fetch(key, *a, *b, cancel).await {
                Ok((mut table, stats)) => {
                    if !stats.chunk_errors.is_empty() {
                        for err in &stats.chunk_errors {
                            attempts.push(SourceAttempt {
                                source: "rest",
                                kind: err.kind,
                                message: err.message.clone(),
                            });
                        }
                    }
                    if !table.is_empty() {
                        table.tag_source(DataSource::Rest);
                        fetched.push(table);
                    }
                }
                Err(err) => {
                    attempts.push(SourceAttempt {
                        source: "rest",
                        kind: err.kind,
                        message: err.message.clone(),
                    });
                    err.emit();
                }
            }
        }
    }

    let mut tables = vec![cached];
    let fresh = FundingTable::merge(fetched);
    if !fresh.is_empty() {
        tables.push(fresh.clone());
    }
    let mut merged = FundingTable::merge(tables);

    if merged.is_empty() && !attempts.is_empty() {
        return Err(EngineError::new(
            ErrorKind::DataEmpty,
            "every funding source failed for the requested range",
        )
        .with("symbol", &key.symbol)
        .with("start", start)
        .with("end", end)
        .with_attempts(attempts));
    }

    if use_cache && !fresh.is_empty() {
        if let Some(store) = cache {
            for (day, day_table) in fresh.partition_by_day() {
                if let Err(err) = store.save_day(key, day, &Table::Funding(day_table)) {
                    warn!(key = %key, day = %day, error = %err, "funding cache write failed");
                }
            }
        }
    }

    validate::check_funding(&merged)?;
    if !opts.include_source_metadata {
        merged.strip_source();
    }
    debug!(key = %key, rows = merged.len(), "funding fetch complete");
    Ok(merged)
}
