//! Binance Vision daily-archive client: URL construction, in-memory ZIP
//! decode, SHA-256 verification against the sibling `.CHECKSUM`, CSV
//! header autodetect and timestamp normalization.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use fs2::FileExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{EngineError, ErrorKind, Result, classify_status, classify_transport};
use crate::interval::{Interval, detect_unit};
use crate::query::SeriesKey;
use crate::schema::{KLINE_COLUMNS, kline_row_from_csv};
use crate::table::KlineTable;

pub const VISION_BASE_URL: &str = "https://data.binance.vision/data";

/// How a checksum mismatch is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    /// Fail the day; the orchestrator falls back to REST.
    #[default]
    Abort,
    /// Keep the data, attach a warning.
    WarnAndProceed,
    /// Do not download or compare checksums at all.
    SkipVerification,
}

impl ChecksumPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumPolicy::Abort => "abort",
            ChecksumPolicy::WarnAndProceed => "warn",
            ChecksumPolicy::SkipVerification => "skip",
        }
    }
}

impl FromStr for ChecksumPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(ChecksumPolicy::Abort),
            "warn" | "proceed_with_warning" => Ok(ChecksumPolicy::WarnAndProceed),
            "skip" | "skip_verification" => Ok(ChecksumPolicy::SkipVerification),
            other => Err(EngineError::new(
                ErrorKind::InvalidRequest,
                format!("unknown checksum policy {other:?}"),
            )),
        }
    }
}

impl fmt::Display for ChecksumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only registry row for a failed archive checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumFailureRecord {
    pub symbol: String,
    pub interval: String,
    pub date: NaiveDate,
    pub expected_hash: String,
    pub actual_hash: String,
    pub ts: i64,
    pub action: String,
}

/// JSON-lines registry behind an exclusive file lock.
#[derive(Debug, Clone)]
pub struct ChecksumFailureLog {
    path: PathBuf,
}

impl ChecksumFailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ChecksumFailureLog { path: path.into() }
    }

    pub fn append(&self, record: &ChecksumFailureRecord) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let line = serde_json::to_string(record)
            .map_err(|e| EngineError::new(ErrorKind::CacheIo, e.to_string()))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        fs2::FileExt::unlock(&file)?;
        Ok(())
    }
}

/// One decoded archive day plus an optional non-fatal warning.
#[derive(Debug, Clone, Default)]
pub struct DayFetch {
    pub table: KlineTable,
    pub warning: Option<String>,
}

pub struct VisionClient {
    http: reqwest::Client,
    base_url: String,
    checksum_policy: ChecksumPolicy,
    failure_log: Option<ChecksumFailureLog>,
    /// Bound on concurrent day downloads in `fetch_range`.
    day_concurrency: usize,
}

impl VisionClient {
    pub fn new(http: reqwest::Client) -> Self {
        VisionClient {
            http,
            base_url: VISION_BASE_URL.to_string(),
            checksum_policy: ChecksumPolicy::default(),
            failure_log: None,
            day_concurrency: 4,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    pub fn with_failure_log(mut self, log: ChecksumFailureLog) -> Self {
        self.failure_log = Some(log);
        self
    }

    pub fn with_day_concurrency(mut self, n: usize) -> Self {
        self.day_concurrency = n.max(1);
        self
    }

    /// Interval token used inside archive paths. The provider stores
    /// 1-second bars under a `1m` directory and filename; mirrored as-is.
    fn archive_interval_token(interval: Interval) -> &'static str {
        match interval {
            Interval::S1 => "1m",
            other => other.code(),
        }
    }

    /// `{base}/{segment}/daily/klines/{SYMBOL}/{IV}/{SYMBOL}-{IV}-{YYYY-MM-DD}.zip`
    pub fn zip_url(&self, key: &SeriesKey, date: NaiveDate) -> String {
        let iv = Self::archive_interval_token(key.interval);
        format!(
            "{}/{}/daily/klines/{}/{}/{}-{}-{}.zip",
            self.base_url,
            key.market_type.vision_segment(),
            key.symbol,
            iv,
            key.symbol,
            iv,
            date.format("%Y-%m-%d")
        )
    }

    pub fn checksum_url(&self, key: &SeriesKey, date: NaiveDate) -> String {
        format!("{}.CHECKSUM", self.zip_url(key, date))
    }

    /// Download and decode one archive day. A `404` is not an error: the
    /// provider simply has no archive for that date (yet).
    pub async fn fetch(&self, key: &SeriesKey, date: NaiveDate) -> Result<DayFetch> {
        let url = self.zip_url(key, date);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::new(classify_transport(&e), e.to_string()).with("url", &url))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(key = %key, date = %date, "archive day unavailable (404)");
            return Ok(DayFetch {
                table: KlineTable::new(),
                warning: Some(format!("archive unavailable for {date}")),
            });
        }
        if !status.is_success() {
            return Err(EngineError::new(
                classify_status(status),
                format!("archive fetch returned HTTP {status}"),
            )
            .with("url", &url));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::new(classify_transport(&e), e.to_string()).with("url", &url))?;

        let mut warning = None;
        if self.checksum_policy != ChecksumPolicy::SkipVerification {
            warning = self.verify_checksum(key, date, &bytes).await?;
        }

        let table = decode_zip(&bytes, key.interval).map_err(|e| {
            e.with("url", &url)
                .with("symbol", &key.symbol)
                .with("date", date)
        })?;
        info!(key = %key, date = %date, rows = table.len(), "decoded archive day");
        Ok(DayFetch { table, warning })
    }

    /// Fetch every archive day overlapping `[start, end]` with bounded
    /// concurrency and slice the concatenation to the range. A single
    /// missing day is tolerated; any decode or checksum abort fails the
    /// whole range so the caller can fall back.
    pub async fn fetch_range(&self, key: &SeriesKey, start: i64, end: i64) -> Result<DayFetch> {
        let aligned_start = key.interval.align_start(start);
        let aligned_end = key.interval.align_end(end);
        if aligned_end < aligned_start {
            return Ok(DayFetch::default());
        }
        let dates = crate::interval::dates_overlapping(aligned_start, aligned_end);
        let fetched: Vec<DayFetch> = stream::iter(dates)
            .map(|date| self.fetch(key, date))
            .buffered(self.day_concurrency)
            .try_collect()
            .await?;

        let mut combined = KlineTable::new();
        let mut warnings = Vec::new();
        for day in fetched {
            if let Some(w) = day.warning {
                warnings.push(w);
            }
            combined.append(day.table);
        }
        combined.sort_and_dedupe();
        let table = combined.slice_range(start, end);
        Ok(DayFetch {
            table,
            warning: if warnings.is_empty() {
                None
            } else {
                Some(warnings.join("; "))
            },
        })
    }

    /// Compare the archive bytes against the published checksum. Returns
    /// an optional warning; errors only under the abort policy.
    async fn verify_checksum(
        &self,
        key: &SeriesKey,
        date: NaiveDate,
        bytes: &[u8],
    ) -> Result<Option<String>> {
        let url = self.checksum_url(key, date);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %key, date = %date, error = %e, "checksum fetch failed, proceeding");
                return Ok(Some(format!("checksum unavailable for {date}")));
            }
        };
        if !response.status().is_success() {
            return Ok(Some(format!("checksum unavailable for {date}")));
        }
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!(key = %key, date = %date, error = %e, "checksum body unreadable, proceeding");
                return Ok(Some(format!("checksum unreadable for {date}")));
            }
        };
        let Some(expected) = body.split_whitespace().next() else {
            return Ok(Some(format!("checksum empty for {date}")));
        };
        let expected = expected.to_lowercase();
        let actual = sha256_hex(bytes);
        if expected == actual {
            return Ok(None);
        }

        let action = match self.checksum_policy {
            ChecksumPolicy::Abort => "abort",
            ChecksumPolicy::WarnAndProceed => "proceed_with_warning",
            ChecksumPolicy::SkipVerification => "skip_verification",
        };
        if let Some(log) = &self.failure_log {
            let record = ChecksumFailureRecord {
                symbol: key.symbol.clone(),
                interval: key.interval.code().to_string(),
                date,
                expected_hash: expected.clone(),
                actual_hash: actual.clone(),
                ts: chrono::Utc::now().timestamp_micros(),
                action: action.to_string(),
            };
            if let Err(e) = log.append(&record) {
                warn!(error = %e, "failed to append checksum failure record");
            }
        }
        match self.checksum_policy {
            ChecksumPolicy::Abort => Err(EngineError::new(
                ErrorKind::ChecksumMismatch,
                format!("archive checksum mismatch for {date}"),
            )
            .with("symbol", &key.symbol)
            .with("expected", expected)
            .with("actual", actual)),
            _ => Ok(Some(format!("checksum mismatch for {date} (kept)"))),
        }
    }
}

/// Open the archive from memory, locate its single CSV entry and decode.
fn decode_zip(bytes: &[u8], interval: Interval) -> Result<KlineTable> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| EngineError::new(ErrorKind::ProtocolFormat, format!("bad zip: {e}")))?;
    let csv_index = (0..archive.len())
        .find(|&i| {
            archive
                .by_index(i)
                .map(|f| f.name().ends_with(".csv"))
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            EngineError::new(ErrorKind::ProtocolFormat, "archive contains no csv entry")
        })?;
    let mut entry = archive
        .by_index(csv_index)
        .map_err(|e| EngineError::new(ErrorKind::ProtocolFormat, format!("bad zip entry: {e}")))?;
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .map_err(|e| EngineError::new(ErrorKind::ProtocolFormat, format!("csv unreadable: {e}")))?;
    parse_archive_csv(&text, interval)
}

/// Decode archive CSV text. Header presence varies by market and year:
/// the first non-empty line is a header iff it contains the token `high`
/// (case-insensitive); otherwise the canonical column order applies.
/// Timestamps take the unit detected from the first data value of column
/// 0 and are scaled to microseconds; open times are never shifted, close
/// times are canonicalized to the period end minus one microsecond.
pub fn parse_archive_csv(text: &str, interval: Interval) -> Result<KlineTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for rec in reader.records() {
        let rec = rec
            .map_err(|e| EngineError::new(ErrorKind::ProtocolFormat, format!("csv parse: {e}")))?;
        if rec.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        records.push(rec);
    }
    let Some(first) = records.first() else {
        return Ok(KlineTable::new());
    };

    let has_header = first.iter().any(|f| f.to_lowercase().contains("high"));
    let data = if has_header {
        // Header column count must still be workable; names are
        // overwritten by position when the width matches.
        if first.len() != KLINE_COLUMNS.len() {
            return Err(EngineError::new(
                ErrorKind::SchemaMismatch,
                format!(
                    "archive header has {} columns, expected {}",
                    first.len(),
                    KLINE_COLUMNS.len()
                ),
            ));
        }
        &records[1..]
    } else {
        &records[..]
    };
    let Some(first_data) = data.first() else {
        return Ok(KlineTable::new());
    };

    let raw_ts = first_data
        .get(0)
        .and_then(|f| f.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            EngineError::new(
                ErrorKind::ProtocolFormat,
                "archive first timestamp is not an integer",
            )
        })?;
    let unit = detect_unit(raw_ts)?;

    let mut table = KlineTable::with_capacity(data.len());
    for rec in data {
        table.push(kline_row_from_csv(rec, unit)?);
    }
    crate::schema::normalize_close_times(&mut table, interval);
    Ok(table)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ChartType, MarketType, Provider};

    fn key(interval: Interval) -> SeriesKey {
        SeriesKey::new(
            Provider::Binance,
            ChartType::Klines,
            MarketType::Spot,
            "BTCUSDT",
            interval,
        )
    }

    fn client() -> VisionClient {
        VisionClient::new(reqwest::Client::new())
    }

    #[test]
    fn zip_url_shape_is_bit_exact() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert_eq!(
            client().zip_url(&key(Interval::H1), date),
            "https://data.binance.vision/data/spot/daily/klines/BTCUSDT/1h/BTCUSDT-1h-2024-06-10.zip"
        );
        assert_eq!(
            client().checksum_url(&key(Interval::H1), date),
            "https://data.binance.vision/data/spot/daily/klines/BTCUSDT/1h/BTCUSDT-1h-2024-06-10.zip.CHECKSUM"
        );
    }

    #[test]
    fn futures_segments_differ_per_market() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let mut k = key(Interval::H1);
        k.market_type = MarketType::FuturesUsdt;
        assert!(client().zip_url(&k, date).contains("/futures/um/daily/klines/"));
        k.market_type = MarketType::FuturesCoin;
        assert!(client().zip_url(&k, date).contains("/futures/cm/daily/klines/"));
    }

    #[test]
    fn one_second_archives_use_the_one_minute_name() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let url = client().zip_url(&key(Interval::S1), date);
        assert_eq!(
            url,
            "https://data.binance.vision/data/spot/daily/klines/BTCUSDT/1m/BTCUSDT-1m-2024-06-10.zip"
        );
    }

    #[test]
    fn headerless_csv_uses_canonical_order() {
        let text = "\
1718020800000,100.0,101.0,99.0,100.5,12.0,1718020859999,1200.0,7,6.0,600.0,0
1718020860000,100.5,102.0,100.0,101.5,13.0,1718020919999,1300.0,8,6.5,650.0,0
";
        let table = parse_archive_csv(text, Interval::M1).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.open_time[0], 1_718_020_800_000_000);
        assert_eq!(table.close_time[1], 1_718_020_919_999_999);
    }

    #[test]
    fn header_row_is_detected_and_skipped() {
        let text = "\
open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_volume,taker_buy_quote_volume,ignore
1718020800000,100.0,101.0,99.0,100.5,12.0,1718020859999,1200.0,7,6.0,600.0,0
";
        let table = parse_archive_csv(text, Interval::M1).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.high[0], 101.0);
    }

    #[test]
    fn microsecond_archives_are_not_rescaled() {
        let text = "\
1718020800000000,100.0,101.0,99.0,100.5,12.0,1718020859999999,1200.0,7,6.0,600.0,0
";
        let table = parse_archive_csv(text, Interval::M1).unwrap();
        assert_eq!(table.open_time[0], 1_718_020_800_000_000);
        assert_eq!(table.close_time[0], 1_718_020_859_999_999);
    }

    #[test]
    fn fourteen_digit_timestamps_are_rejected() {
        let text = "\
17180208000000,100.0,101.0,99.0,100.5,12.0,17180208599990,1200.0,7,6.0,600.0,0
";
        let err = parse_archive_csv(text, Interval::M1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimestampFormat);
    }

    #[test]
    fn header_with_wrong_width_is_schema_mismatch() {
        let text = "open_time,high,low\n1,2,3\n";
        let err = parse_archive_csv(text, Interval::M1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaMismatch);
    }

    #[test]
    fn empty_csv_decodes_to_an_empty_table() {
        assert!(parse_archive_csv("", Interval::M1).unwrap().is_empty());
        assert!(parse_archive_csv("\n\n", Interval::M1).unwrap().is_empty());
    }

    #[test]
    fn failure_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = ChecksumFailureLog::new(dir.path().join("_checksum_failures.log"));
        let record = ChecksumFailureRecord {
            symbol: "BTCUSDT".into(),
            interval: "1h".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 11).unwrap(),
            expected_hash: "aa".into(),
            actual_hash: "bb".into(),
            ts: 1,
            action: "abort".into(),
        };
        log.append(&record).unwrap();
        log.append(&record).unwrap();
        let text = std::fs::read_to_string(dir.path().join("_checksum_failures.log")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ChecksumFailureRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.action, "abort");
    }
}
