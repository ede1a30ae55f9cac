//! Archive client behavior against a mock CDN: ZIP decode, checksum
//! policies, missing days and day-boundary merging.

use std::io::Write;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crypto_market_data::error::ErrorKind;
use crypto_market_data::interval::{Interval, MICROS_PER_SEC, day_start_micros};
use crypto_market_data::query::{ChartType, MarketType, Provider, SeriesKey};
use crypto_market_data::vision::{ChecksumFailureLog, ChecksumPolicy, VisionClient};

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

fn zip_path(date: &str) -> String {
    format!("/data/spot/daily/klines/BTCUSDT/1m/BTCUSDT-1m-{date}.zip")
}

fn make_zip(csv: &str) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        writer
            .start_file("data.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(csv.as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Headerless one-minute CSV covering `minutes` of the given UTC date,
/// timestamps in milliseconds.
fn day_csv(date: NaiveDate, minutes: std::ops::Range<i64>) -> String {
    let day_ms = day_start_micros(date) / 1_000;
    let mut out = String::new();
    for m in minutes {
        let t = day_ms + m * 60_000;
        out.push_str(&format!(
            "{t},100.0,101.0,99.0,100.5,12.0,{},1200.0,7,6.0,600.0,0\n",
            t + 59_999
        ));
    }
    out
}

async fn mount_day(server: &MockServer, date: &str, bytes: Vec<u8>, with_checksum: bool) {
    if with_checksum {
        let checksum = format!("{}  BTCUSDT-1m-{date}.zip\n", sha256_hex(&bytes));
        Mock::given(method("GET"))
            .and(path(format!("{}.CHECKSUM", zip_path(date))))
            .respond_with(ResponseTemplate::new(200).set_body_string(checksum))
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(zip_path(date)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(server)
        .await;
}

fn client_for(server: &MockServer) -> VisionClient {
    VisionClient::new(reqwest::Client::new()).with_base_url(format!("{}/data", server.uri()))
}

#[tokio::test]
async fn verified_day_decodes_without_warning() {
    let server = MockServer::start().await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
    let bytes = make_zip(&day_csv(date, 0..10));
    mount_day(&server, "2024-06-10", bytes, true).await;

    let day = client_for(&server).fetch(&key(), date).await.unwrap();
    assert_eq!(day.table.len(), 10);
    assert!(day.warning.is_none());
    assert_eq!(day.table.open_time[0], day_start_micros(date));
    // Close times are canonical microsecond period ends.
    assert_eq!(day.table.close_time[0], day_start_micros(date) + MIN_US - 1);
}

#[tokio::test]
async fn missing_checksum_is_a_warning_not_an_error() {
    let server = MockServer::start().await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
    let bytes = make_zip(&day_csv(date, 0..5));
    mount_day(&server, "2024-06-10", bytes, false).await;

    let day = client_for(&server).fetch(&key(), date).await.unwrap();
    assert_eq!(day.table.len(), 5);
    assert!(day.warning.unwrap().contains("checksum unavailable"));
}

#[tokio::test]
async fn missing_archive_day_is_empty_with_a_marker() {
    let server = MockServer::start().await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();

    let day = client_for(&server).fetch(&key(), date).await.unwrap();
    assert!(day.table.is_empty());
    assert!(day.warning.unwrap().contains("unavailable"));
}

#[tokio::test]
async fn checksum_mismatch_aborts_and_is_registered() {
    let server = MockServer::start().await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 11).unwrap();
    let bytes = make_zip(&day_csv(date, 0..5));
    Mock::given(method("GET"))
        .and(path(format!("{}.CHECKSUM", zip_path("2024-06-11"))))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("deadbeef  BTCUSDT-1m-2024-06-11.zip\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(zip_path("2024-06-11")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("_checksum_failures.log");
    let client = client_for(&server)
        .with_checksum_policy(ChecksumPolicy::Abort)
        .with_failure_log(ChecksumFailureLog::new(&log_path));

    let err = client.fetch(&key(), date).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ChecksumMismatch);

    let registry = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(registry.lines().count(), 1);
    assert!(registry.contains("\"action\":\"abort\""));
    assert!(registry.contains("deadbeef"));
}

#[tokio::test]
async fn mismatch_with_warn_policy_keeps_the_data() {
    let server = MockServer::start().await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 11).unwrap();
    let bytes = make_zip(&day_csv(date, 0..5));
    Mock::given(method("GET"))
        .and(path(format!("{}.CHECKSUM", zip_path("2024-06-11"))))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("deadbeef  BTCUSDT-1m-2024-06-11.zip\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(zip_path("2024-06-11")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(&server)
        .await;

    let client = client_for(&server).with_checksum_policy(ChecksumPolicy::WarnAndProceed);
    let day = client.fetch(&key(), date).await.unwrap();
    assert_eq!(day.table.len(), 5);
    assert!(day.warning.unwrap().contains("mismatch"));
}

#[tokio::test]
async fn skip_policy_never_requests_the_checksum() {
    let server = MockServer::start().await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
    let bytes = make_zip(&day_csv(date, 0..3));
    mount_day(&server, "2024-06-10", bytes, false).await;

    let client = client_for(&server).with_checksum_policy(ChecksumPolicy::SkipVerification);
    let day = client.fetch(&key(), date).await.unwrap();
    assert_eq!(day.table.len(), 3);
    assert!(day.warning.is_none());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].url.path().ends_with(".CHECKSUM"));
}

#[tokio::test]
async fn range_fetch_merges_across_the_day_boundary() {
    let server = MockServer::start().await;
    let first = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
    let second = NaiveDate::from_ymd_opt(2024, 6, 11).unwrap();
    // 23:58 and 23:59 on the first day, 00:00 and 00:01 on the second.
    mount_day(
        &server,
        "2024-06-10",
        make_zip(&day_csv(first, 1438..1440)),
        true,
    )
    .await;
    mount_day(
        &server,
        "2024-06-11",
        make_zip(&day_csv(second, 0..2)),
        true,
    )
    .await;

    let start = day_start_micros(first) + 1438 * MIN_US;
    let end = day_start_micros(second) + MIN_US;
    let day = client_for(&server)
        .fetch_range(&key(), start, end)
        .await
        .unwrap();

    assert_eq!(day.table.len(), 4);
    for pair in day.table.open_time.windows(2) {
        assert_eq!(pair[1] - pair[0], MIN_US);
    }
    assert_eq!(day.table.open_time[2], day_start_micros(second));
}

#[tokio::test]
async fn one_missing_day_in_a_range_is_tolerated() {
    let server = MockServer::start().await;
    let first = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
    mount_day(
        &server,
        "2024-06-10",
        make_zip(&day_csv(first, 1438..1440)),
        true,
    )
    .await;
    // 2024-06-11 is not mounted: the CDN has no archive for it yet.

    let start = day_start_micros(first) + 1438 * MIN_US;
    let end = day_start_micros(first) + 1441 * MIN_US;
    let day = client_for(&server)
        .fetch_range(&key(), start, end)
        .await
        .unwrap();
    assert_eq!(day.table.len(), 2);
    assert!(day.warning.unwrap().contains("unavailable"));
}
