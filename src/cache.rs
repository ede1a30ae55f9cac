//! Day-sharded columnar cache with an integrity index.
//!
//! One Arrow IPC file per UTC day per series, addressed by
//! `{root}/{PROVIDER}/{CHART_TYPE}/{MARKET_TYPE}/{SYMBOL}/{INTERVAL}/{YYYY-MM-DD}.arrow`.
//! The single-file JSON index is authoritative: a shard counts as cached
//! only while an index entry exists and its SHA-256 matches the bytes on
//! disk. Writes are day-granular and atomic (write-temp-then-rename), the
//! index is persisted under an exclusive file lock.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{EngineError, ErrorKind, Result};
use crate::gaps;
use crate::interval::day_bounds_micros;
use crate::query::{ChartType, SeriesKey};
use crate::schema;
use crate::table::{FundingTable, KlineTable, Table};

const INDEX_FILE: &str = "_index.json";
const INDEX_LOCK: &str = "_index.lock";

/// One indexed day shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub byte_size: u64,
    pub row_count: u64,
    pub sha256: String,
    pub mtime: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: BTreeMap<String, IndexEntry>,
}

/// Hit/miss/error counters for one store instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Outcome of one day-shard lookup: `Absent → Reading → Verified | Corrupt`.
enum DayState {
    Absent,
    Verified(Table),
    Corrupt,
}

pub struct CacheStore {
    root: PathBuf,
    index: Mutex<IndexFile>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl CacheStore {
    /// Open (or create) a cache rooted at `root` and load its index.
    /// Index entries whose files have vanished are purged up front.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = CacheStore {
            index: Mutex::new(load_index(&root)?),
            root,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        };
        store.purge_stale_entries()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Indexed shard count, total bytes and total rows.
    pub fn shard_summary(&self) -> (usize, u64, u64) {
        let index = self.lock_index();
        let bytes = index.entries.values().map(|e| e.byte_size).sum();
        let rows = index.entries.values().map(|e| e.row_count).sum();
        (index.entries.len(), bytes, rows)
    }

    /// Read every verified day shard overlapping `[start, end]`,
    /// concatenate and slice, and report the bar-level gaps that remain.
    pub fn probe(&self, key: &SeriesKey, start: i64, end: i64) -> Result<(Table, Vec<(i64, i64)>)> {
        let aligned_start = key.interval.align_start(start);
        let aligned_end = key.interval.align_end(end);
        if aligned_end < aligned_start {
            return Ok((empty_table(key.chart_type), Vec::new()));
        }

        let dates = crate::interval::dates_overlapping(aligned_start, aligned_end);
        let mut day_tables = Vec::new();
        let mut missing_days = Vec::new();
        for date in dates {
            match self.read_day(key, date)? {
                DayState::Verified(table) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    day_tables.push(table);
                }
                DayState::Absent => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    missing_days.push(date);
                }
                DayState::Corrupt => {
                    // Invalidated on the way here; a corrupt shard is a miss.
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    missing_days.push(date);
                }
            }
        }

        match key.chart_type {
            ChartType::Klines => {
                let mut combined = KlineTable::new();
                for t in day_tables {
                    combined.append(t.into_klines()?);
                }
                let sliced = combined.slice_range(start, end);
                let gaps =
                    gaps::missing_ranges(&sliced.open_time, start, end, key.interval);
                Ok((Table::Klines(sliced), gaps))
            }
            ChartType::FundingRate => {
                // Funding timestamps do not sit on a fixed grid; gaps are
                // day-granular.
                let mut combined = FundingTable::new();
                for t in day_tables {
                    combined.append(t.into_funding()?);
                }
                let sliced = combined.slice_range(start, end);
                let mut day_gaps = Vec::new();
                for date in missing_days {
                    let (ds, de) = day_bounds_micros(date);
                    let a = ds.max(start);
                    let b = (de - 1).min(end);
                    if a <= b {
                        day_gaps.push((a, b));
                    }
                }
                Ok((Table::Funding(sliced), day_gaps))
            }
        }
    }

    /// Atomically persist one day of data. An existing shard for the same
    /// day is merged in (union by timestamp, the new rows win).
    pub fn save_day(&self, key: &SeriesKey, day: NaiveDate, table: &Table) -> Result<()> {
        let (day_start, day_end) = day_bounds_micros(day);
        let mut sliced = match table {
            Table::Klines(t) => {
                let mut t = t.slice_range(day_start, day_end - 1);
                t.strip_source();
                Table::Klines(t)
            }
            Table::Funding(t) => {
                let mut t = t.slice_range(day_start, day_end - 1);
                t.strip_source();
                Table::Funding(t)
            }
        };
        if sliced.is_empty() {
            return Ok(());
        }

        if let DayState::Verified(existing) = self.read_day(key, day)? {
            sliced = merge_day(existing, sliced)?;
        }

        let bytes = schema::table_to_ipc(&sliced)?;
        let digest = sha256_hex(&bytes);
        let path = self.day_path(key, day);
        let dir = path
            .parent()
            .ok_or_else(|| EngineError::new(ErrorKind::CacheIo, "day shard has no parent dir"))?;
        fs::create_dir_all(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        fs::write(tmp.path(), &bytes)?;
        tmp.persist(&path)
            .map_err(|e| EngineError::new(ErrorKind::CacheIo, e.to_string()))?;

        let entry = IndexEntry {
            path: self.relative_path(key, day),
            byte_size: bytes.len() as u64,
            row_count: sliced.len() as u64,
            sha256: digest,
            mtime: unix_now(),
        };
        {
            let mut index = self.lock_index();
            index.entries.insert(index_key(key, day), entry);
            self.persist_index(&index)?;
        }
        debug!(key = %key, day = %day, rows = sliced.len(), "saved day shard");
        Ok(())
    }

    /// Drop one day shard and its index row.
    pub fn invalidate(&self, key: &SeriesKey, day: NaiveDate) -> Result<()> {
        let path = self.day_path(key, day);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut index = self.lock_index();
        if index.entries.remove(&index_key(key, day)).is_some() {
            self.persist_index(&index)?;
        }
        Ok(())
    }

    fn read_day(&self, key: &SeriesKey, day: NaiveDate) -> Result<DayState> {
        let entry = {
            let index = self.lock_index();
            index.entries.get(&index_key(key, day)).cloned()
        };
        let Some(entry) = entry else {
            return Ok(DayState::Absent);
        };
        let path = self.root.join(&entry.path);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(_) => {
                // Index row without a file is stale.
                warn!(key = %key, day = %day, "purging stale index entry");
                self.invalidate(key, day)?;
                return Ok(DayState::Absent);
            }
        };
        if sha256_hex(&bytes) != entry.sha256 {
            warn!(key = %key, day = %day, "day shard failed checksum, invalidating");
            self.invalidate(key, day)?;
            return Ok(DayState::Corrupt);
        }
        match schema::table_from_ipc(key.chart_type, &bytes) {
            Ok(table) => Ok(DayState::Verified(table)),
            Err(err) => {
                // Schema drift invalidates the shard like corruption does.
                warn!(key = %key, day = %day, error = %err, "day shard failed decode, invalidating");
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.invalidate(key, day)?;
                Ok(DayState::Corrupt)
            }
        }
    }

    fn purge_stale_entries(&self) -> Result<()> {
        let mut index = self.lock_index();
        let before = index.entries.len();
        let root = self.root.clone();
        index.entries.retain(|_, e| root.join(&e.path).exists());
        if index.entries.len() != before {
            self.persist_index(&index)?;
        }
        Ok(())
    }

    fn day_path(&self, key: &SeriesKey, day: NaiveDate) -> PathBuf {
        self.root.join(self.relative_path(key, day))
    }

    fn relative_path(&self, key: &SeriesKey, day: NaiveDate) -> String {
        format!("{}/{}.arrow", key.cache_dir(), day.format("%Y-%m-%d"))
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, IndexFile> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist_index(&self, index: &IndexFile) -> Result<()> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.root.join(INDEX_LOCK))?;
        lock.lock_exclusive()?;
        let json = serde_json::to_string_pretty(index)
            .map_err(|e| EngineError::new(ErrorKind::CacheIo, e.to_string()))?;
        let tmp = NamedTempFile::new_in(&self.root)?;
        fs::write(tmp.path(), json)?;
        tmp.persist(self.root.join(INDEX_FILE))
            .map_err(|e| EngineError::new(ErrorKind::CacheIo, e.to_string()))?;
        fs2::FileExt::unlock(&lock)?;
        Ok(())
    }
}

fn load_index(root: &Path) -> Result<IndexFile> {
    let path = root.join(INDEX_FILE);
    if !path.exists() {
        return Ok(IndexFile::default());
    }
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(root.join(INDEX_LOCK))?;
    lock.lock_shared()?;
    let contents = fs::read_to_string(&path)?;
    fs2::FileExt::unlock(&lock)?;
    match serde_json::from_str(&contents) {
        Ok(index) => Ok(index),
        Err(err) => {
            // A mangled index means no shard can be trusted; start empty
            // and let fetches rebuild it.
            warn!(error = %err, "cache index unreadable, starting empty");
            Ok(IndexFile::default())
        }
    }
}

fn index_key(key: &SeriesKey, day: NaiveDate) -> String {
    format!("{}/{}", key.cache_dir(), day.format("%Y-%m-%d"))
}

fn empty_table(chart_type: ChartType) -> Table {
    match chart_type {
        ChartType::Klines => Table::Klines(KlineTable::new()),
        ChartType::FundingRate => Table::Funding(FundingTable::new()),
    }
}

/// Union an existing day shard with fresh rows; on timestamp conflicts
/// the fresh rows win.
fn merge_day(existing: Table, fresh: Table) -> Result<Table> {
    match (existing, fresh) {
        (Table::Klines(old), Table::Klines(new)) => {
            let new_times: std::collections::HashSet<i64> =
                new.open_time.iter().copied().collect();
            let mut merged = KlineTable::new();
            for row in old.rows().filter(|r| !new_times.contains(&r.open_time)) {
                merged.push(row);
            }
            merged.append(new);
            merged.sort_and_dedupe();
            Ok(Table::Klines(merged))
        }
        (Table::Funding(old), Table::Funding(new)) => {
            let new_times: std::collections::HashSet<i64> =
                new.funding_time.iter().copied().collect();
            let mut merged = FundingTable::new();
            for i in 0..old.len() {
                if !new_times.contains(&old.funding_time[i]) {
                    merged.push(old.row(i));
                }
            }
            merged.append(new);
            merged.sort_and_dedupe();
            Ok(Table::Funding(merged))
        }
        _ => Err(EngineError::new(
            ErrorKind::SchemaMismatch,
            "day shard chart type changed between writes",
        )),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::{Interval, MICROS_PER_SEC};
    use crate::query::{MarketType, Provider};
    use crate::table::KlineRow;

    const MIN: i64 = 60 * MICROS_PER_SEC;

    fn key() -> SeriesKey {
        SeriesKey::new(
            Provider::Binance,
            ChartType::Klines,
            MarketType::Spot,
            "BTCUSDT",
            Interval::M1,
        )
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    fn day_table(date: NaiveDate, minutes: std::ops::Range<i64>) -> KlineTable {
        let (day_start, _) = day_bounds_micros(date);
        let mut t = KlineTable::new();
        for m in minutes {
            let ot = day_start + m * MIN;
            t.push(KlineRow {
                open_time: ot,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
                close_time: ot + MIN - 1,
                quote_asset_volume: 15.0,
                count: 3,
                taker_buy_volume: 5.0,
                taker_buy_quote_volume: 7.5,
                ignore: 0.0,
            });
        }
        t
    }

    #[test]
    fn save_then_probe_round_trips_rows_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let table = day_table(day(), 0..1440);
        store
            .save_day(&key(), day(), &Table::Klines(table.clone()))
            .unwrap();

        let (day_start, day_end) = day_bounds_micros(day());
        let (probed, gaps) = store.probe(&key(), day_start, day_end - 1).unwrap();
        let probed = probed.into_klines().unwrap();
        assert_eq!(probed, table);
        assert!(gaps.is_empty());
        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn missing_day_is_a_miss_and_one_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let (day_start, day_end) = day_bounds_micros(day());
        let (probed, gaps) = store.probe(&key(), day_start, day_end - 1).unwrap();
        assert!(probed.is_empty());
        assert_eq!(gaps, vec![(day_start, day_end - MIN)]);
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn partial_day_reports_interior_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        // First 10 minutes only.
        store
            .save_day(&key(), day(), &Table::Klines(day_table(day(), 0..10)))
            .unwrap();
        let (day_start, _) = day_bounds_micros(day());
        let end = day_start + 19 * MIN;
        let (probed, gaps) = store.probe(&key(), day_start, end).unwrap();
        assert_eq!(probed.len(), 10);
        assert_eq!(gaps, vec![(day_start + 10 * MIN, end)]);
    }

    #[test]
    fn corrupted_shard_is_invalidated_and_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        store
            .save_day(&key(), day(), &Table::Klines(day_table(day(), 0..1440)))
            .unwrap();
        let shard = store.day_path(&key(), day());
        fs::write(&shard, b"garbage").unwrap();

        let (day_start, day_end) = day_bounds_micros(day());
        let (probed, gaps) = store.probe(&key(), day_start, day_end - 1).unwrap();
        assert!(probed.is_empty());
        assert_eq!(gaps.len(), 1);
        assert!(!shard.exists());
        assert_eq!(store.stats().misses, 1);

        // Second probe sees a plain miss: the index row is gone too.
        let (_, gaps) = store.probe(&key(), day_start, day_end - 1).unwrap();
        assert_eq!(gaps.len(), 1);
    }

    #[test]
    fn stale_index_entries_are_purged_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CacheStore::open(dir.path()).unwrap();
            store
                .save_day(&key(), day(), &Table::Klines(day_table(day(), 0..5)))
                .unwrap();
            fs::remove_file(store.day_path(&key(), day())).unwrap();
        }
        let store = CacheStore::open(dir.path()).unwrap();
        let index = store.lock_index();
        assert!(index.entries.is_empty());
    }

    #[test]
    fn same_day_rewrite_merges_with_new_rows_winning() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        store
            .save_day(&key(), day(), &Table::Klines(day_table(day(), 0..10)))
            .unwrap();

        // Overlapping rewrite with a different close price.
        let (day_start, _) = day_bounds_micros(day());
        let mut update = KlineTable::new();
        for m in 5..15 {
            let ot = day_start + m * MIN;
            update.push(KlineRow {
                open_time: ot,
                close: 9.9,
                close_time: ot + MIN - 1,
                ..KlineRow::default()
            });
        }
        store
            .save_day(&key(), day(), &Table::Klines(update))
            .unwrap();

        let (probed, _) = store
            .probe(&key(), day_start, day_start + 14 * MIN)
            .unwrap();
        let probed = probed.into_klines().unwrap();
        assert_eq!(probed.len(), 15);
        assert_eq!(probed.close[4], 1.5);
        assert_eq!(probed.close[5], 9.9);
        assert_eq!(probed.close[14], 9.9);
    }

    #[test]
    fn funding_probe_reports_day_granular_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let fkey = SeriesKey::new(
            Provider::Binance,
            ChartType::FundingRate,
            MarketType::FuturesUsdt,
            "BTCUSDT",
            Interval::H8,
        );
        let (day_start, day_end) = day_bounds_micros(day());
        let (probed, gaps) = store.probe(&fkey, day_start, day_end - 1).unwrap();
        assert!(probed.is_empty());
        assert_eq!(gaps, vec![(day_start, day_end - 1)]);
    }
}
