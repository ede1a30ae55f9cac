//! Source composition: cache probe, gap computation, per-gap archive →
//! REST failover, precedence merge, cache write-back and the final
//! schema guarantee.
//!
//! Sources are interchangeable behind a small capability trait so the
//! composition logic never knows which provider (or test stub) sits on
//! the other side.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::error::{EngineError, ErrorKind, Result, SourceAttempt};
use crate::okx::OkxRestClient;
use crate::query::{ChartType, FetchOptions, SeriesKey, SourcePolicy};
use crate::rest::BinanceRestClient;
use crate::table::{DataSource, KlineTable, Table};
use crate::validate;
use crate::vision::VisionClient;

/// One fetchable bar source.
#[async_trait]
pub trait RangeSource: Send + Sync {
    fn describe(&self) -> &'static str;

    /// Fetch the inclusive window `[start, end]` as canonical-schema
    /// klines. An empty table means the source has nothing there, which
    /// is not an error.
    async fn fetch_range(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
        cancel: &CancellationToken,
    ) -> Result<KlineTable>;
}

/// Archive-backed source.
pub struct VisionSource {
    client: VisionClient,
}

impl VisionSource {
    pub fn new(client: VisionClient) -> Self {
        VisionSource { client }
    }
}

#[async_trait]
impl RangeSource for VisionSource {
    fn describe(&self) -> &'static str {
        "vision"
    }

    async fn fetch_range(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
        _cancel: &CancellationToken,
    ) -> Result<KlineTable> {
        let day = self.client.fetch_range(key, start, end).await?;
        if let Some(warning) = day.warning {
            debug!(key = %key, warning = %warning, "archive range warning");
        }
        Ok(day.table)
    }
}

/// Live Binance REST source.
pub struct BinanceKlineSource {
    client: BinanceRestClient,
}

impl BinanceKlineSource {
    pub fn new(client: BinanceRestClient) -> Self {
        BinanceKlineSource { client }
    }
}

#[async_trait]
impl RangeSource for BinanceKlineSource {
    fn describe(&self) -> &'static str {
        "rest"
    }

    async fn fetch_range(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
        cancel: &CancellationToken,
    ) -> Result<KlineTable> {
        let (table, stats) = self.client.fetch(key, start, end, cancel).await?;
        if table.is_empty() && !stats.chunk_errors.is_empty() {
            let first = stats.chunk_errors[0].clone();
            return Err(first);
        }
        if !stats.failed_ranges.is_empty() {
            warn!(
                key = %key,
                failed = stats.failed_ranges.len(),
                completed = stats.completed_chunks,
                "returning partial REST data"
            );
        }
        Ok(table)
    }
}

/// Live OKX REST source.
pub struct OkxKlineSource {
    client: OkxRestClient,
}

impl OkxKlineSource {
    pub fn new(client: OkxRestClient) -> Self {
        OkxKlineSource { client }
    }
}

#[async_trait]
impl RangeSource for OkxKlineSource {
    fn describe(&self) -> &'static str {
        "rest"
    }

    async fn fetch_range(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
        cancel: &CancellationToken,
    ) -> Result<KlineTable> {
        let (table, stats) = self.client.fetch(key, start, end, cancel).await?;
        if table.is_empty() && !stats.chunk_errors.is_empty() {
            return Err(stats.chunk_errors[0].clone());
        }
        Ok(table)
    }
}

/// Drives one kline query across cache, archive and REST.
pub struct Orchestrator {
    cache: Option<Arc<CacheStore>>,
    vision: Option<Arc<dyn RangeSource>>,
    rest: Arc<dyn RangeSource>,
}

impl Orchestrator {
    pub fn new(rest: Arc<dyn RangeSource>) -> Self {
        Orchestrator {
            cache: None,
            vision: None,
            rest,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn RangeSource>) -> Self {
        self.vision = Some(vision);
        self
    }

    /// Compose `[start, end]` from the configured sources under `opts`.
    pub async fn get_klines(
        &self,
        key: &SeriesKey,
        start: i64,
        end: i64,
        opts: &FetchOptions,
        cancel: &CancellationToken,
    ) -> Result<KlineTable> {
        key.validate()?;
        if key.chart_type != ChartType::Klines {
            return Err(EngineError::new(
                ErrorKind::InvalidRequest,
                "kline composition requested for a non-kline chart type",
            ));
        }
        if end < start {
            return Err(EngineError::new(
                ErrorKind::InvalidRequest,
                "range end precedes start",
            )
            .with("start", start)
            .with("end", end));
        }
        if matches!(opts.enforce_source, SourcePolicy::Cache)
            && (!opts.use_cache || self.cache.is_none())
        {
            return Err(EngineError::new(
                ErrorKind::InvalidRequest,
                "cache-only fetch with the cache disabled",
            ));
        }
        if matches!(opts.enforce_source, SourcePolicy::Vision) && self.vision.is_none() {
            return Err(EngineError::new(
                ErrorKind::InvalidRequest,
                "no archive source for this provider",
            ));
        }

        let use_cache = opts.use_cache && self.cache.is_some();
        let mut attempts: Vec<SourceAttempt> = Vec::new();

        // The probe completes before any gap fetch starts.
        let (mut cached, gaps) = if use_cache {
            let store = self
                .cache
                .as_ref()
                .ok_or_else(|| EngineError::new(ErrorKind::CacheIo, "cache store unavailable"))?;
            let (table, gaps) = store.probe(key, start, end)?;
            (table.into_klines()?, gaps)
        } else {
            (KlineTable::new(), vec![(start, end)])
        };
        cached.tag_source(DataSource::Cache);
        debug!(key = %key, cached_rows = cached.len(), gaps = gaps.len(), "cache probe complete");

        let mut fetched: Vec<KlineTable> = Vec::new();
        for (gap_start, gap_end) in gaps {
            match opts.enforce_source {
                SourcePolicy::Cache => {
                    // No network allowed; the gap stays open.
                }
                SourcePolicy::Vision => {
                    let vision = self.vision.as_ref().ok_or_else(|| {
                        EngineError::new(ErrorKind::InvalidRequest, "no archive source")
                    })?;
                    let mut table = vision
                        .fetch_range(key, gap_start, gap_end, cancel)
                        .await
                        .map_err(|e| e.with_attempts(attempts.clone()))?;
                    if !table.is_empty() {
                        table.tag_source(DataSource::Vision);
                        fetched.push(table);
                    }
                }
                SourcePolicy::Rest => {
                    let mut table = self
                        .rest
                        .fetch_range(key, gap_start, gap_end, cancel)
                        .await
                        .map_err(|e| e.with_attempts(attempts.clone()))?;
                    if !table.is_empty() {
                        table.tag_source(DataSource::Rest);
                        fetched.push(table);
                    }
                }
                SourcePolicy::Auto => {
                    // Archive first, strictly sequentially; REST only
                    // after the archive decision for the same gap.
                    let mut filled = false;
                    if let Some(vision) = &self.vision {
                        match vision.fetch_range(key, gap_start, gap_end, cancel).await {
                            Ok(table) if !table.is_empty() => {
                                let mut table = table;
                                table.tag_source(DataSource::Vision);
                                fetched.push(table);
                                filled = true;
                            }
                            Ok(_) => {
                                debug!(key = %key, gap_start, gap_end, "archive empty for gap");
                            }
                            Err(err) => {
                                attempts.push(SourceAttempt {
                                    source: vision.describe(),
                                    kind: err.kind,
                                    message: err.message.clone(),
                                });
                                err.emit();
                            }
                        }
                    }
                    if !filled {
                        match self.rest.fetch_range(key, gap_start, gap_end, cancel).await {
                            Ok(table) if !table.is_empty() => {
                                let mut table = table;
                                table.tag_source(DataSource::Rest);
                                fetched.push(table);
                            }
                            Ok(_) => {
                                debug!(key = %key, gap_start, gap_end, "no source had data for gap");
                            }
                            Err(err) => {
                                attempts.push(SourceAttempt {
                                    source: self.rest.describe(),
                                    kind: err.kind,
                                    message: err.message.clone(),
                                });
                                err.emit();
                            }
                        }
                    }
                }
            }
        }

        let fresh = KlineTable::merge(fetched);
        let mut tables = vec![cached];
        if !fresh.is_empty() {
            tables.push(fresh.clone());
        }
        let mut merged = KlineTable::merge(tables);

        if merged.is_empty() && !attempts.is_empty() {
            return Err(EngineError::new(
                ErrorKind::DataEmpty,
                "every configured source failed for the requested range",
            )
            .with("symbol", &key.symbol)
            .with("interval", key.interval)
            .with("start", start)
            .with("end", end)
            .with_attempts(attempts));
        }

        if use_cache && !fresh.is_empty() {
            self.update_cache(key, &fresh);
        }

        validate::check_klines(&merged, key.interval)?;
        if !opts.include_source_metadata {
            merged.strip_source();
        }
        info!(key = %key, rows = merged.len(), "kline composition complete");
        Ok(merged)
    }

    /// Persist freshly fetched rows day by day. Cache write failures are
    /// logged, never surfaced: the data in hand is already valid.
    fn update_cache(&self, key: &SeriesKey, fresh: &KlineTable) {
        let Some(store) = &self.cache else {
            return;
        };
        for (day, day_table) in fresh.partition_by_day() {
            if let Err(err) = store.save_day(key, day, &Table::Klines(day_table)) {
                warn!(key = %key, day = %day, error = %err, "cache write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn bars(range: std::ops::Range<i64>, close: f64) -> KlineTable {
        let mut t = KlineTable::new();
        for m in range {
            let ot = m * MIN;
            t.push(KlineRow {
                open_time: ot,
                close,
                close_time: ot + MIN - 1,
                ..KlineRow::default()
            });
        }
        t
    }

    enum StubBehavior {
        Data(KlineTable),
        Empty,
        Fail(ErrorKind),
    }

    struct StubSource {
        name: &'static str,
        behavior: Mutex<StubBehavior>,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(name: &'static str, behavior: StubBehavior) -> Arc<Self> {
            Arc::new(StubSource {
                name,
                behavior: Mutex::new(behavior),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl RangeSource for StubSource {
        fn describe(&self) -> &'static str {
            self.name
        }

        async fn fetch_range(
            &self,
            _key: &SeriesKey,
            start: i64,
            end: i64,
            _cancel: &CancellationToken,
        ) -> Result<KlineTable> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let behavior = self.behavior.lock().unwrap();
            match &*behavior {
                StubBehavior::Data(table) => Ok(table.slice_range(start, end)),
                StubBehavior::Empty => Ok(KlineTable::new()),
                StubBehavior::Fail(kind) => Err(EngineError::new(*kind, "stub failure")),
            }
        }
    }

    fn opts() -> FetchOptions {
        FetchOptions {
            use_cache: false,
            ..FetchOptions::default()
        }
    }

    #[tokio::test]
    async fn archive_satisfies_the_gap_without_touching_rest() {
        let vision = StubSource::new("vision", StubBehavior::Data(bars(0..10, 1.0)));
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..10, 2.0)));
        let orch = Orchestrator::new(rest.clone()).with_vision(vision.clone());

        let table = orch
            .get_klines(&key(), 0, 9 * MIN, &opts(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(table.len(), 10);
        assert_eq!(table.close[0], 1.0);
        assert_eq!(vision.calls(), 1);
        assert_eq!(rest.calls(), 0);
    }

    #[tokio::test]
    async fn empty_archive_falls_through_to_rest() {
        let vision = StubSource::new("vision", StubBehavior::Empty);
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..10, 2.0)));
        let orch = Orchestrator::new(rest.clone()).with_vision(vision.clone());

        let table = orch
            .get_klines(&key(), 0, 9 * MIN, &opts(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(table.len(), 10);
        assert_eq!(table.close[0], 2.0);
        assert_eq!(vision.calls(), 1);
        assert_eq!(rest.calls(), 1);
    }

    #[tokio::test]
    async fn archive_failure_falls_back_to_rest() {
        let vision = StubSource::new("vision", StubBehavior::Fail(ErrorKind::ChecksumMismatch));
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..10, 2.0)));
        let orch = Orchestrator::new(rest.clone()).with_vision(vision.clone());

        let table = orch
            .get_klines(&key(), 0, 9 * MIN, &opts(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(table.len(), 10);
        assert_eq!(table.close[0], 2.0);
    }

    #[tokio::test]
    async fn enforcing_rest_never_consults_the_archive() {
        let vision = StubSource::new("vision", StubBehavior::Data(bars(0..10, 1.0)));
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..10, 2.0)));
        let orch = Orchestrator::new(rest.clone()).with_vision(vision.clone());

        let mut o = opts();
        o.enforce_source = SourcePolicy::Rest;
        let table = orch
            .get_klines(&key(), 0, 9 * MIN, &o, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(table.close[0], 2.0);
        assert_eq!(vision.calls(), 0);
        assert_eq!(rest.calls(), 1);
    }

    #[tokio::test]
    async fn enforcing_vision_surfaces_archive_errors() {
        let vision = StubSource::new("vision", StubBehavior::Fail(ErrorKind::ChecksumMismatch));
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..10, 2.0)));
        let orch = Orchestrator::new(rest.clone()).with_vision(vision.clone());

        let mut o = opts();
        o.enforce_source = SourcePolicy::Vision;
        let err = orch
            .get_klines(&key(), 0, 9 * MIN, &o, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChecksumMismatch);
        assert_eq!(rest.calls(), 0);
    }

    #[tokio::test]
    async fn cache_only_with_cache_disabled_errors_before_any_io() {
        let vision = StubSource::new("vision", StubBehavior::Data(bars(0..10, 1.0)));
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..10, 2.0)));
        let orch = Orchestrator::new(rest.clone()).with_vision(vision.clone());

        let mut o = opts();
        o.use_cache = false;
        o.enforce_source = SourcePolicy::Cache;
        let err = orch
            .get_klines(&key(), 0, 9 * MIN, &o, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert_eq!(vision.calls(), 0);
        assert_eq!(rest.calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_combination_rejects_synchronously() {
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..10, 2.0)));
        let orch = Orchestrator::new(rest.clone());

        let bad = SeriesKey::new(
            Provider::Binance,
            ChartType::Klines,
            MarketType::FuturesCoin,
            "BTCUSD_PERP",
            Interval::S1,
        );
        let err = orch
            .get_klines(&bad, 0, 9 * MIN, &opts(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedInterval);
        assert_eq!(rest.calls(), 0);
    }

    #[tokio::test]
    async fn all_sources_failing_is_a_terminal_error_with_attempts() {
        let vision = StubSource::new("vision", StubBehavior::Fail(ErrorKind::ChecksumMismatch));
        let rest = StubSource::new("rest", StubBehavior::Fail(ErrorKind::NetworkConnection));
        let orch = Orchestrator::new(rest.clone()).with_vision(vision.clone());

        let err = orch
            .get_klines(&key(), 0, 9 * MIN, &opts(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataEmpty);
        assert_eq!(err.attempts.len(), 2);
        assert_eq!(err.attempts[0].source, "vision");
        assert_eq!(err.attempts[1].source, "rest");
    }

    #[tokio::test]
    async fn source_metadata_is_stripped_unless_requested() {
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..5, 2.0)));
        let orch = Orchestrator::new(rest.clone());

        let table = orch
            .get_klines(&key(), 0, 4 * MIN, &opts(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(table.source.is_none());

        let mut o = opts();
        o.include_source_metadata = true;
        let table = orch
            .get_klines(&key(), 0, 4 * MIN, &o, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            table.source.as_ref().unwrap(),
            &vec![DataSource::Rest; 5]
        );
    }

    #[tokio::test]
    async fn cache_hit_avoids_every_network_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::open(dir.path()).unwrap());
        let vision = StubSource::new("vision", StubBehavior::Empty);
        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..1440, 2.0)));
        let orch = Orchestrator::new(rest.clone())
            .with_vision(vision.clone())
            .with_cache(store.clone());

        let o = FetchOptions::default();
        let cancel = CancellationToken::new();
        // First call fills the cache via REST.
        let first = orch
            .get_klines(&key(), 0, 1439 * MIN, &o, &cancel)
            .await
            .unwrap();
        assert_eq!(first.len(), 1440);
        assert_eq!(rest.calls(), 1);

        // Second call is served from cache alone.
        let second = orch
            .get_klines(&key(), 0, 1439 * MIN, &o, &cancel)
            .await
            .unwrap();
        assert_eq!(second.len(), 1440);
        assert_eq!(rest.calls(), 1);
        assert_eq!(vision.calls(), 1);
        let stats = store.stats();
        assert!(stats.hits >= 1);
    }

    #[tokio::test]
    async fn partial_cache_fetches_only_the_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::open(dir.path()).unwrap());
        // Pre-populate the first 10 minutes.
        store
            .save_day(
                &key(),
                chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
                &Table::Klines(bars(0..10, 1.0)),
            )
            .unwrap();

        let rest = StubSource::new("rest", StubBehavior::Data(bars(0..20, 2.0)));
        let orch = Orchestrator::new(rest.clone()).with_cache(store.clone());

        let o = FetchOptions {
            include_source_metadata: true,
            ..FetchOptions::default()
        };
        let table = orch
            .get_klines(&key(), 0, 19 * MIN, &o, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(table.len(), 20);
        // Cached rows keep cache precedence; the gap came from REST.
        assert_eq!(table.close[0], 1.0);
        assert_eq!(table.close[10], 2.0);
        assert_eq!(rest.calls(), 1);
    }
}
