//! OKX kline client. Two endpoints (recent and delayed-history), uppercase
//! interval codes for hours and above, `before`/`after` timestamp
//! pagination with newest-first pages, and projection onto the canonical
//! kline schema so the output is indistinguishable from the other
//! providers'.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{EngineConfig, rest_endpoints};
use crate::error::{EngineError, ErrorKind, Result};
use crate::interval::Interval;
use crate::query::{MarketType, Provider, SeriesKey};
use crate::rest::{
    EndpointRotation, FetchStats, RequestPolicy, RetryCounters, TimeoutIncident,
    get_json_with_retry,
};
use crate::table::{KlineRow, KlineTable};

const HISTORY_PATH: &str = "/api/v5/market/history-candles";
const RECENT_PATH: &str = "/api/v5/market/candles";
/// The history endpoint caps pages at 100 records, the recent one at 300.
const HISTORY_LIMIT: usize = 100;
const RECENT_LIMIT: usize = 300;

pub struct OkxRestClient {
    http: reqwest::Client,
    rotation: Arc<EndpointRotation>,
    config: EngineConfig,
}

impl OkxRestClient {
    pub fn new(http: reqwest::Client, market: MarketType, config: EngineConfig) -> Self {
        OkxRestClient {
            http,
            rotation: Arc::new(EndpointRotation::new(rest_endpoints(
                Provider::Okx,
                market,
            ))),
            config,
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.rotation = Arc::new(EndpointRotation::new(endpoints));
        self
    }

    /// Walk the history endpoint backwards from the window end, then top
    /// up the freshest bars from the recent endpoint (history data is
    /// published with a delay). Same retry/rotation/deadline rules as the
    /// Binance engine.
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
        let bar = key.interval.okx_code().ok_or_else(|| {
            EngineError::new(
                ErrorKind::UnsupportedInterval,
                format!("OKX has no {} bar", key.interval),
            )
        })?;
        let inst_id = to_inst_id(&key.symbol, key.market_type);
        let policy = RequestPolicy {
            fetch_timeout: self.config.fetch_timeout,
            max_retries: self.config.max_retries,
        };
        let counters = RetryCounters::default();
        let end_ms = aligned_end / 1_000;

        let deadline = sleep(self.config.whole_fetch_deadline());
        tokio::pin!(deadline);
        let mut tables: Vec<KlineTable> = Vec::new();
        let mut after_ms = end_ms + 1;
        let mut topped_up = false;
        loop {
            let (path, limit) = if topped_up {
                (HISTORY_PATH, HISTORY_LIMIT)
            } else {
                (RECENT_PATH, RECENT_LIMIT)
            };
            stats.chunk_count += 1;
            let query = format!(
                "{path}?instId={inst_id}&bar={bar}&after={after_ms}&limit={limit}"
            );
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stats.cancelled = true;
                    break;
                }
                _ = &mut deadline => {
                    stats.timed_out = true;
                    let incident = TimeoutIncident {
                        operation: "okx_klines_fetch",
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
                        chunk_count = incident.chunk_count,
                        completed_chunks = incident.completed_chunks,
                        "whole-fetch deadline expired, returning completed pages"
                    );
                    stats.timeout_incident = Some(incident);
                    break;
                }
                page = get_json_with_retry(&self.http, &self.rotation, &query, policy, &counters) => page,
            };
            let value = match page {
                Ok(value) => value,
                Err(err) => {
                    stats.chunk_errors.push(err.clone());
                    stats.failed_ranges.push((aligned_start, after_ms * 1_000 - 1));
                    err.emit();
                    break;
                }
            };
            let page_table = parse_okx_page(&value, key.interval)?;
            stats.completed_chunks += 1;
            let oldest = page_table.first_open_time();
            if !page_table.is_empty() {
                tables.push(page_table);
            }
            match oldest {
                // The recent endpoint only holds the newest bars; once it
                // drains, continue backwards from the history endpoint.
                None if !topped_up => topped_up = true,
                None => break,
                Some(oldest_micros) => {
                    if oldest_micros <= aligned_start {
                        break;
                    }
                    after_ms = oldest_micros / 1_000;
                }
            }
        }

        stats.retries = counters.retries.load(std::sync::atomic::Ordering::Relaxed);
        stats.rate_limited = counters
            .rate_limited
            .load(std::sync::atomic::Ordering::Relaxed);
        let mut merged = KlineTable::merge(tables);
        merged = merged.slice_range(aligned_start, aligned_end);
        stats.elapsed = started.elapsed();
        Ok((merged, stats))
    }
}

/// Map an engine symbol onto an OKX instrument id. Symbols already in
/// OKX form (`BTC-USDT`, `BTC-USD-SWAP`) pass through.
pub fn to_inst_id(symbol: &str, market: MarketType) -> String {
    if symbol.contains('-') {
        return symbol.to_string();
    }
    let trimmed = symbol.strip_suffix("_PERP").unwrap_or(symbol);
    const QUOTES: [&str; 6] = ["USDT", "USDC", "USD", "BTC", "ETH", "EUR"];
    let split = QUOTES.iter().find_map(|q| {
        trimmed
            .strip_suffix(q)
            .filter(|base| !base.is_empty())
            .map(|base| (base, *q))
    });
    match market {
        MarketType::Spot => match split {
            Some((base, quote)) => format!("{base}-{quote}"),
            None => trimmed.to_string(),
        },
        MarketType::FuturesUsdt => {
            let base = split.map(|(b, _)| b).unwrap_or(trimmed);
            format!("{base}-USDT-SWAP")
        }
        MarketType::FuturesCoin => {
            let base = split.map(|(b, _)| b).unwrap_or(trimmed);
            format!("{base}-USD-SWAP")
        }
    }
}

/// Decode one OKX page envelope. Pages arrive newest-first; rows are
/// reversed into ascending order here. Missing Binance-only columns are
/// zero-filled so the schema stays canonical.
fn parse_okx_page(value: &serde_json::Value, interval: Interval) -> Result<KlineTable> {
    let code = value.get("code").and_then(|v| v.as_str()).unwrap_or("");
    if code != "0" {
        let msg = value
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown OKX error");
        let kind = if code == "51000" {
            ErrorKind::UnsupportedInterval
        } else {
            ErrorKind::ProtocolFormat
        };
        return Err(EngineError::new(kind, format!("OKX code {code}: {msg}")));
    }
    let data = value
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::new(ErrorKind::ProtocolFormat, "OKX page lacks data array"))?;

    let mut table = KlineTable::with_capacity(data.len());
    for entry in data.iter().rev() {
        let fields = entry.as_array().ok_or_else(|| {
            EngineError::new(ErrorKind::ProtocolFormat, "OKX candle is not an array")
        })?;
        if fields.len() < 6 {
            return Err(EngineError::new(
                ErrorKind::SchemaMismatch,
                format!("OKX candle has {} fields, expected at least 6", fields.len()),
            ));
        }
        let ts_ms = field_i64(&fields[0], "ts")?;
        let open_time = ts_ms * 1_000;
        table.push(KlineRow {
            open_time,
            open: field_f64(&fields[1], "open")?,
            high: field_f64(&fields[2], "high")?,
            low: field_f64(&fields[3], "low")?,
            close: field_f64(&fields[4], "close")?,
            volume: field_f64(&fields[5], "volume")?,
            close_time: interval.close_of(open_time),
            quote_asset_volume: fields
                .get(7)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0),
            count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            ignore: 0.0,
        });
    }
    Ok(table)
}

fn field_i64(value: &serde_json::Value, name: &str) -> Result<i64> {
    value
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| value.as_i64())
        .ok_or_else(|| {
            EngineError::new(
                ErrorKind::ProtocolFormat,
                format!("OKX {name} {value} is not an integer"),
            )
        })
}

fn field_f64(value: &serde_json::Value, name: &str) -> Result<f64> {
    value
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| value.as_f64())
        .ok_or_else(|| {
            EngineError::new(
                ErrorKind::ProtocolFormat,
                format!("OKX {name} {value} is not a number"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_ids_for_each_market() {
        assert_eq!(to_inst_id("BTCUSDT", MarketType::Spot), "BTC-USDT");
        assert_eq!(to_inst_id("ETHBTC", MarketType::Spot), "ETH-BTC");
        assert_eq!(
            to_inst_id("BTCUSDT", MarketType::FuturesUsdt),
            "BTC-USDT-SWAP"
        );
        assert_eq!(
            to_inst_id("BTCUSD_PERP", MarketType::FuturesCoin),
            "BTC-USD-SWAP"
        );
        // Already in OKX form: untouched.
        assert_eq!(to_inst_id("BTC-USDT", MarketType::Spot), "BTC-USDT");
        assert_eq!(
            to_inst_id("BTC-USD-SWAP", MarketType::FuturesCoin),
            "BTC-USD-SWAP"
        );
    }

    #[test]
    fn pages_are_reversed_into_ascending_order() {
        let value = serde_json::json!({
            "code": "0",
            "msg": "",
            "data": [
                ["1718020860000", "101.0", "102.0", "100.0", "101.5", "13.0", "13.1", "1300.0", "1"],
                ["1718020800000", "100.0", "101.0", "99.0", "100.5", "12.0", "12.1", "1200.0", "1"]
            ]
        });
        let table = parse_okx_page(&value, Interval::M1).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.open_time[0], 1_718_020_800_000_000);
        assert_eq!(table.open_time[1], 1_718_020_860_000_000);
        assert_eq!(table.close_time[0], 1_718_020_860_000_000 - 1);
        assert_eq!(table.quote_asset_volume[0], 1200.0);
        assert_eq!(table.count[0], 0);
    }

    #[test]
    fn error_envelope_maps_the_unsupported_code() {
        let value = serde_json::json!({"code": "51000", "msg": "Parameter bar error", "data": []});
        let err = parse_okx_page(&value, Interval::M1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedInterval);

        let value = serde_json::json!({"code": "50011", "msg": "rate", "data": []});
        let err = parse_okx_page(&value, Interval::M1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolFormat);
    }

    #[test]
    fn short_candles_are_schema_mismatches() {
        let value = serde_json::json!({
            "code": "0",
            "msg": "",
            "data": [["1718020800000", "100.0"]]
        });
        let err = parse_okx_page(&value, Interval::M1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaMismatch);
    }
}
