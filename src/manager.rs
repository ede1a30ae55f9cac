//! Stateless facade over the composition machinery. One manager owns one
//! REST client, one archive client and one cache handle for the lifetime
//! of a logical session, and routes queries to the kline or funding flow.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheStats, CacheStore};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::funding::{self, FundingRateClient};
use crate::interval::Interval;
use crate::okx::OkxRestClient;
use crate::orchestrator::{BinanceKlineSource, OkxKlineSource, Orchestrator, VisionSource};
use crate::query::{ChartType, FetchOptions, MarketType, Provider, SeriesKey};
use crate::rest::BinanceRestClient;
use crate::table::Table;
use crate::vision::{ChecksumFailureLog, VisionClient};

const USER_AGENT: &str = concat!("crypto-market-data/", env!("CARGO_PKG_VERSION"));

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()
        .map_err(|e| EngineError::new(ErrorKind::NetworkConnection, e.to_string()))
}

pub struct DataManager {
    provider: Provider,
    market_type: MarketType,
    chart_type: ChartType,
    cache: Option<Arc<CacheStore>>,
    orchestrator: Option<Orchestrator>,
    funding: Option<FundingRateClient>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("provider", &self.provider)
            .field("market_type", &self.market_type)
            .field("chart_type", &self.chart_type)
            .finish()
    }
}

impl DataManager {
    /// Wire up clients and cache for one `(provider, market, chart)`
    /// combination. Flags resolve explicit config → environment →
    /// defaults; pass `EngineConfig::from_env()` with fields overridden
    /// for the explicit layer.
    pub fn new(
        provider: Provider,
        market_type: MarketType,
        chart_type: ChartType,
        config: EngineConfig,
    ) -> Result<Self> {
        if chart_type == ChartType::FundingRate && !market_type.is_futures() {
            return Err(EngineError::new(
                ErrorKind::InvalidRequest,
                "funding rates exist only on futures markets",
            ));
        }

        // Separate clients so archive downloads and REST calls keep
        // independent connection pools.
        let rest_http = build_http_client()?;
        let vision_http = build_http_client()?;

        let cache = if config.enable_cache {
            Some(Arc::new(CacheStore::open(&config.cache_root)?))
        } else {
            None
        };

        let mut orchestrator = None;
        let mut funding = None;
        match chart_type {
            ChartType::Klines => {
                let mut orch = match provider {
                    Provider::Binance => {
                        let rest =
                            BinanceRestClient::new(rest_http, market_type, config.clone());
                        let vision = VisionClient::new(vision_http)
                            .with_checksum_policy(config.checksum_policy)
                            .with_day_concurrency(config.vision_day_concurrency)
                            .with_failure_log(ChecksumFailureLog::new(
                                config.cache_root.join("_checksum_failures.log"),
                            ));
                        Orchestrator::new(Arc::new(BinanceKlineSource::new(rest)))
                            .with_vision(Arc::new(VisionSource::new(vision)))
                    }
                    Provider::Okx => {
                        // OKX publishes no daily archive; composition is
                        // cache + REST only.
                        let rest = OkxRestClient::new(rest_http, market_type, config.clone());
                        Orchestrator::new(Arc::new(OkxKlineSource::new(rest)))
                    }
                };
                if let Some(store) = &cache {
                    orch = orch.with_cache(store.clone());
                }
                orchestrator = Some(orch);
            }
            ChartType::FundingRate => {
                if provider != Provider::Binance {
                    return Err(EngineError::new(
                        ErrorKind::InvalidRequest,
                        "funding-rate retrieval is only wired for Binance",
                    ));
                }
                funding = Some(FundingRateClient::new(rest_http, market_type, config));
            }
        }

        Ok(DataManager {
            provider,
            market_type,
            chart_type,
            cache,
            orchestrator,
            funding,
            cancel: CancellationToken::new(),
        })
    }

    /// A token that aborts every in-flight request of this manager when
    /// cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fetch one series range as a canonical-schema table.
    pub async fn get_data(
        &self,
        symbol: &str,
        start: i64,
        end: i64,
        interval: Interval,
        opts: &FetchOptions,
    ) -> Result<Table> {
        let key = SeriesKey::new(
            self.provider,
            self.chart_type,
            self.market_type,
            symbol,
            interval,
        );
        key.validate()?;
        debug!(key = %key, start, end, "query received");
        match self.chart_type {
            ChartType::Klines => {
                let orchestrator = self.orchestrator.as_ref().ok_or_else(|| {
                    EngineError::new(ErrorKind::InvalidRequest, "kline engine not configured")
                })?;
                let table = orchestrator
                    .get_klines(&key, start, end, opts, &self.cancel)
                    .await?;
                Ok(Table::Klines(table))
            }
            ChartType::FundingRate => {
                let client = self.funding.as_ref().ok_or_else(|| {
                    EngineError::new(ErrorKind::InvalidRequest, "funding engine not configured")
                })?;
                let table = funding::get_funding(
                    self.cache.as_deref(),
                    client,
                    &key,
                    start,
                    end,
                    opts,
                    &self.cancel,
                )
                .await?;
                Ok(Table::Funding(table))
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .as_ref()
            .map(|c| c.stats())
            .unwrap_or_default()
    }

    /// Tear the manager down: abort outstanding work, then release the
    /// HTTP clients and the cache handle. Connection pools close when the
    /// last clone drops; the cancel signal guarantees no task outlives
    /// this call holding one.
    pub fn close(self) {
        self.cancel.cancel();
    }
}

impl Drop for DataManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
