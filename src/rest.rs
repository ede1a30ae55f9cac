//! Binance REST kline client: interval-aware chunking, bounded-concurrency
//! dispatch over a rotating endpoint pool, retries with exponential
//! backoff, per-request timeouts and a whole-fetch deadline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{EngineConfig, binance_kline_path, rest_endpoints};
use crate::error::{EngineError, ErrorKind, Result, classify_status, classify_transport};
use crate::interval::Interval;
use crate::query::{MarketType, Provider, SeriesKey};
use crate::schema::kline_row_from_json;
use crate::table::KlineTable;

/// Round-robin pool of functionally equivalent hosts. The cursor is the
/// only mutable state in the client and sits behind a mutex.
#[derive(Debug)]
pub struct EndpointRotation {
    endpoints: Vec<String>,
    cursor: Mutex<usize>,
}

impl EndpointRotation {
    pub fn new(endpoints: Vec<String>) -> Self {
        debug_assert!(!endpoints.is_empty());
        EndpointRotation {
            endpoints,
            cursor: Mutex::new(0),
        }
    }

    pub fn next(&self) -> String {
        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let endpoint = self.endpoints[*cursor % self.endpoints.len()].clone();
        *cursor = cursor.wrapping_add(1);
        endpoint
    }
}

/// Per-request retry knobs shared by every REST-speaking client.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestPolicy {
    pub fetch_timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Default)]
pub(crate) struct RetryCounters {
    pub retries: AtomicU32,
    pub rate_limited: AtomicU32,
}

/// One whole-fetch timeout incident, mirrored to the `timeouts` log
/// target.
#[derive(Debug, Clone)]
pub struct TimeoutIncident {
    pub operation: &'static str,
    pub duration: Duration,
    pub symbol: String,
    pub interval: String,
    pub start: i64,
    pub end: i64,
    pub chunk_count: usize,
    pub completed_chunks: usize,
}

/// Accounting for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct FetchStats {
    pub chunk_count: usize,
    pub completed_chunks: usize,
    pub retries: u32,
    pub rate_limited: u32,
    pub failed_ranges: Vec<(i64, i64)>,
    pub chunk_errors: Vec<EngineError>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub timeout_incident: Option<TimeoutIncident>,
    pub elapsed: Duration,
}

/// Partition an aligned inclusive window into chunks whose expected
/// record count stays at or under `records_per_chunk`, further bounded by
/// the per-interval span cap. Successive chunks are half-open neighbors:
/// each starts one microsecond after its predecessor ends.
pub fn compute_chunks(
    start: i64,
    end: i64,
    interval: Interval,
    records_per_chunk: usize,
) -> Vec<(i64, i64)> {
    let mut chunks = Vec::new();
    if end < start {
        return chunks;
    }
    let full_span = records_per_chunk as i64 * interval.micros();
    let span = match interval.span_cap_micros() {
        Some(cap) => full_span.min(cap),
        None => full_span,
    };
    let mut cs = start;
    while cs <= end {
        let ce = (cs + span - 1).min(end);
        chunks.push((cs, ce));
        cs = ce + 1;
    }
    chunks
}

/// Shared retry loop: rotate endpoints, honor `Retry-After` on 418/429,
/// back off exponentially (capped at 60 s) on transient failures, give up
/// after the retry budget.
pub(crate) async fn get_json_with_retry(
    http: &reqwest::Client,
    rotation: &EndpointRotation,
    path_and_query: &str,
    policy: RequestPolicy,
    counters: &RetryCounters,
) -> Result<serde_json::Value> {
    let mut delays = ExponentialBackoff::from_millis(2)
        .factor(1000)
        .max_delay(Duration::from_secs(60));
    let mut attempts = 0u32;
    loop {
        let endpoint = rotation.next();
        let url = format!("{endpoint}{path_and_query}");
        let outcome = http
            .get(&url)
            .timeout(policy.fetch_timeout)
            .send()
            .await;
        let err = match outcome {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        EngineError::new(classify_transport(&e), e.to_string()).with("url", &url)
                    });
                }
                let kind = classify_status(status);
                if kind == ErrorKind::RateLimit {
                    attempts += 1;
                    counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    if attempts > policy.max_retries {
                        return Err(EngineError::new(
                            ErrorKind::ChunkFailure,
                            format!("rate limited {attempts} times"),
                        )
                        .with("url", &url));
                    }
                    let delay = retry_after(&response).unwrap_or(Duration::from_secs(1));
                    debug!(url = %url, status = %status, delay_ms = delay.as_millis() as u64, "rate limited, rotating endpoint");
                    sleep(delay).await;
                    continue;
                }
                EngineError::new(kind, format!("HTTP {status}")).with("url", &url)
            }
            Err(e) => EngineError::new(classify_transport(&e), e.to_string()).with("url", &url),
        };

        if !err.is_retryable() {
            return Err(err);
        }
        attempts += 1;
        counters.retries.fetch_add(1, Ordering::Relaxed);
        if attempts > policy.max_retries {
            return Err(EngineError::new(
                ErrorKind::ChunkFailure,
                format!("retry budget exhausted after {attempts} attempts: {}", err.message),
            )
            .with("url", &url));
        }
        let delay = delays.next().unwrap_or(Duration::from_secs(60));
        debug!(url = %url, kind = err.kind.as_str(), delay_ms = delay.as_millis() as u64, "transient failure, backing off");
        sleep(delay).await;
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub struct BinanceRestClient {
    http: reqwest::Client,
    rotation: Arc<EndpointRotation>,
    path: &'static str,
    config: EngineConfig,
}

impl BinanceRestClient {
    pub fn new(http: reqwest::Client, market: MarketType, config: EngineConfig) -> Self {
        BinanceRestClient {
            http,
            rotation: Arc::new(EndpointRotation::new(rest_endpoints(
                Provider::Binance,
                market,
            ))),
            path: binance_kline_path(market),
            config,
        }
    }

    /// Point the client at a custom endpoint pool (tests, proxies).
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.rotation = Arc::new(EndpointRotation::new(endpoints));
        self
    }

    /// Fetch `[start, end]` as one table. Chunk failures never fail the
    /// batch: completed chunks are returned and the failed ranges are
    /// reported in the stats. The same partial-result policy applies when
    /// the whole-fetch deadline fires or the caller cancels.
    pub async fn fetch(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
        cancel: &CancellationToken,
    ) -> Result<(KlineTable, FetchStats)> {
        let started = Instant::now();
        let mut stats = FetchStats::default();
        let aligned_start = key.interval.align_start(start);
        let aligned_end = key.interval.align_end(end);
        if aligned_end < aligned_start {
            return Ok((KlineTable::new(), stats));
        }

        let chunks = compute_chunks(
            aligned_start,
            aligned_end,
            key.interval,
            self.config.records_per_chunk,
        );
        stats.chunk_count = chunks.len();
        let semaphore = Arc::new(Semaphore::new(self.config.resolved_concurrency()));
        let counters = Arc::new(RetryCounters::default());
        let policy = RequestPolicy {
            fetch_timeout: self.config.fetch_timeout,
            max_retries: self.config.max_retries,
        };

        let mut join: JoinSet<(i64, i64, Result<KlineTable>)> = JoinSet::new();
        for (cs, ce) in chunks {
            let http = self.http.clone();
            let rotation = self.rotation.clone();
            let semaphore = semaphore.clone();
            let counters = counters.clone();
            let path = self.path;
            let symbol = key.symbol.clone();
            let interval = key.interval;
            let records_per_chunk = self.config.records_per_chunk;
            join.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = fetch_chunk(
                    &http,
                    &rotation,
                    path,
                    policy,
                    &counters,
                    &symbol,
                    interval,
                    cs,
                    ce,
                    records_per_chunk,
                )
                .await;
                (cs, ce, result)
            });
        }

        let deadline = tokio::time::sleep(self.config.whole_fetch_deadline());
        tokio::pin!(deadline);
        let mut tables = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join.abort_all();
                    stats.cancelled = true;
                    debug!(symbol = %key.symbol, "fetch cancelled by caller");
                    break;
                }
                _ = &mut deadline => {
                    join.abort_all();
                    stats.timed_out = true;
                    let incident = TimeoutIncident {
                        operation: "klines_fetch",
                        duration: started.elapsed(),
                        symbol: key.symbol.clone(),
                        interval: key.interval.code().to_string(),
                        start: aligned_start,
                        end: aligned_end,
                        chunk_count: stats.chunk_count,
                        completed_chunks: stats.completed_chunks,
                    };
                    warn!(
                        target: "timeouts",
                        operation = incident.operation,
                        duration_ms = incident.duration.as_millis() as u64,
                        symbol = %incident.symbol,
                        interval = %incident.interval,
                        start = incident.start,
                        end = incident.end,
                        chunk_count = incident.chunk_count,
                        completed_chunks = incident.completed_chunks,
                        "whole-fetch deadline expired, returning completed chunks"
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
                        Some(Ok((cs, ce, Err(err)))) => {
                            err.emit();
                            stats.failed_ranges.push((cs, ce));
                            stats.chunk_errors.push(err);
                        }
                        Some(Err(join_err)) => {
                            if !join_err.is_cancelled() {
                                warn!(error = %join_err, "chunk task panicked");
                            }
                        }
                    }
                }
            }
        }
        // Dropping the set aborts whatever abort_all has not reaped yet;
        // no request survives past this point.
        drop(join);

        stats.retries = counters.retries.load(Ordering::Relaxed);
        stats.rate_limited = counters.rate_limited.load(Ordering::Relaxed);
        let mut merged = KlineTable::merge(tables);
        merged = merged.slice_range(aligned_start, aligned_end);
        stats.elapsed = started.elapsed();
        Ok((merged, stats))
    }
}

/// Fetch and parse a single chunk. A 404 means the provider has no data
/// for the range and decodes to an empty table; zero-row responses are
/// valid (sparse markets have empty windows).
#[allow(clippy::too_many_arguments)]
async fn fetch_chunk(
    http: &reqwest::Client,
    rotation: &EndpointRotation,
    path: &str,
    policy: RequestPolicy,
    counters: &RetryCounters,
    symbol: &str,
    interval: Interval,
    cs: i64,
    ce: i64,
    records_per_chunk: usize,
) -> Result<KlineTable> {
    let query = format!(
        "{path}?symbol={symbol}&interval={}&startTime={}&endTime={}&limit={records_per_chunk}",
        interval.code(),
        cs / 1_000,
        ce / 1_000,
    );
    let value = match get_json_with_retry(http, rotation, &query, policy, counters).await {
        Ok(value) => value,
        Err(err) if err.kind == ErrorKind::ResourceNotFound => {
            return Ok(KlineTable::new());
        }
        Err(err) => {
            return Err(err
                .with("symbol", symbol)
                .with("chunk_start", cs)
                .with("chunk_end", ce));
        }
    };
    let entries = value.as_array().ok_or_else(|| {
        EngineError::new(ErrorKind::ProtocolFormat, "kline response is not an array")
            .with("symbol", symbol)
    })?;
    let mut table = KlineTable::with_capacity(entries.len());
    for entry in entries {
        table.push(kline_row_from_json(entry)?);
    }
    crate::schema::normalize_close_times(&mut table, interval);
    Ok(table)
}
