//! Cache persistence across store instances: byte-stable round-trips,
//! index integrity and hit/miss accounting.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crypto_market_data::cache::CacheStore;
use crypto_market_data::interval::{Interval, MICROS_PER_SEC, day_start_micros};
use crypto_market_data::query::{ChartType, MarketType, Provider, SeriesKey};
use crypto_market_data::table::{KlineRow, KlineTable, Table};

const MIN_US: i64 = 60 * MICROS_PER_SEC;

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

fn full_day_table() -> KlineTable {
    let base = day_start_micros(day());
    let mut t = KlineTable::new();
    for m in 0..1440 {
        let ot = base + m * MIN_US;
        t.push(KlineRow {
            open_time: ot,
            open: 100.0 + m as f64,
            high: 101.0 + m as f64,
            low: 99.0 + m as f64,
            close: 100.5 + m as f64,
            volume: 12.0,
            close_time: ot + MIN_US - 1,
            quote_asset_volume: 1200.0,
            count: 7,
            taker_buy_volume: 6.0,
            taker_buy_quote_volume: 600.0,
            ignore: 0.0,
        });
    }
    t
}

#[test]
fn round_trip_survives_a_store_restart() {
    let dir = tempfile::tempdir().unwrap();
    let table = full_day_table();
    {
        let store = CacheStore::open(dir.path()).unwrap();
        store
            .save_day(&key(), day(), &Table::Klines(table.clone()))
            .unwrap();
    }

    let store = CacheStore::open(dir.path()).unwrap();
    let base = day_start_micros(day());
    let (probed, gaps) = store.probe(&key(), base, base + 1439 * MIN_US).unwrap();
    let probed = probed.into_klines().unwrap();
    assert_eq!(probed, table);
    assert!(gaps.is_empty());
    assert_eq!(store.stats().hits, 1);
    assert_eq!(store.stats().misses, 0);
}

#[test]
fn the_layout_matches_the_documented_tree() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    store
        .save_day(&key(), day(), &Table::Klines(full_day_table()))
        .unwrap();

    let shard = dir
        .path()
        .join("BINANCE/KLINES/SPOT/BTCUSDT/1m/2024-06-10.arrow");
    assert!(shard.exists());
    assert!(dir.path().join("_index.json").exists());
}

#[test]
fn the_indexed_hash_matches_the_bytes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    store
        .save_day(&key(), day(), &Table::Klines(full_day_table()))
        .unwrap();

    let shard = dir
        .path()
        .join("BINANCE/KLINES/SPOT/BTCUSDT/1m/2024-06-10.arrow");
    let bytes = std::fs::read(&shard).unwrap();
    let digest = hex::encode(Sha256::digest(&bytes));

    let index: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("_index.json")).unwrap())
            .unwrap();
    let entry = &index["entries"]["BINANCE/KLINES/SPOT/BTCUSDT/1m/2024-06-10"];
    assert_eq!(entry["sha256"].as_str().unwrap(), digest);
    assert_eq!(entry["row_count"].as_u64().unwrap(), 1440);
    assert_eq!(entry["byte_size"].as_u64().unwrap(), bytes.len() as u64);
}

#[test]
fn a_sub_range_slices_without_touching_other_days() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::open(dir.path()).unwrap();
    store
        .save_day(&key(), day(), &Table::Klines(full_day_table()))
        .unwrap();

    let base = day_start_micros(day());
    let (probed, gaps) = store
        .probe(&key(), base + 100 * MIN_US, base + 199 * MIN_US)
        .unwrap();
    let probed = probed.into_klines().unwrap();
    assert_eq!(probed.len(), 100);
    assert_eq!(probed.open_time[0], base + 100 * MIN_US);
    assert!(gaps.is_empty());
}

#[test]
fn tampering_after_save_is_detected_on_the_next_open() {
    let dir = tempfile::tempdir().unwrap();
    let shard = dir
        .path()
        .join("BINANCE/KLINES/SPOT/BTCUSDT/1m/2024-06-10.arrow");
    {
        let store = CacheStore::open(dir.path()).unwrap();
        store
            .save_day(&key(), day(), &Table::Klines(full_day_table()))
            .unwrap();
        // Flip one byte behind the store's back.
        let mut bytes = std::fs::read(&shard).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&shard, bytes).unwrap();
    }

    let store = CacheStore::open(dir.path()).unwrap();
    let base = day_start_micros(day());
    let (probed, gaps) = store.probe(&key(), base, base + 1439 * MIN_US).unwrap();
    assert!(probed.is_empty());
    assert_eq!(gaps.len(), 1);
    assert!(!shard.exists());
}
