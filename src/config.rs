//! Engine configuration and provider endpoint tables.
//!
//! Resolution order for every knob: explicit argument (struct field set
//! by the caller) → environment variable → built-in default.
//! `EngineConfig::from_env` produces the env-over-default layer; callers
//! override fields on the returned value for the explicit layer.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::query::{MarketType, Provider};
use crate::vision::ChecksumPolicy;

pub const DEFAULT_RECORDS_PER_CHUNK: usize = 1000;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(9);
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(9);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CACHE_ROOT: &str = "./cache";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_root: PathBuf,
    /// `false` disables cache reads and writes.
    pub enable_cache: bool,
    /// Per-request timeout.
    pub fetch_timeout: Duration,
    /// Upper bound on the whole-fetch deadline.
    pub max_timeout: Duration,
    pub max_retries: u32,
    pub records_per_chunk: usize,
    /// In-flight request cap; `None` resolves from host resources.
    pub concurrency: Option<usize>,
    /// Parallel archive-day downloads.
    pub vision_day_concurrency: usize,
    /// Funding pages in flight; the funding endpoint is cheap but paged.
    pub funding_concurrency: usize,
    pub checksum_policy: ChecksumPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            enable_cache: true,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            records_per_chunk: DEFAULT_RECORDS_PER_CHUNK,
            concurrency: None,
            vision_day_concurrency: 4,
            funding_concurrency: 2,
            checksum_policy: ChecksumPolicy::Abort,
        }
    }
}

impl EngineConfig {
    /// Built-in defaults overlaid with recognized environment variables.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();
        if let Some(enabled) = env_flag("ENABLE_CACHE") {
            cfg.enable_cache = enabled;
        }
        if let Some(root) = env_string("CACHE_ROOT") {
            cfg.cache_root = PathBuf::from(root);
        }
        if let Some(secs) = env_f64("MAX_TIMEOUT") {
            cfg.max_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = env_f64("FETCH_TIMEOUT") {
            cfg.fetch_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(n) = env_u32("MAX_RETRIES") {
            cfg.max_retries = n;
        }
        if let Some(raw) = env_string("VISION_CHECKSUM_POLICY") {
            match raw.parse::<ChecksumPolicy>() {
                Ok(policy) => cfg.checksum_policy = policy,
                Err(_) => warn!(value = %raw, "ignoring unrecognized VISION_CHECKSUM_POLICY"),
            }
        }
        cfg
    }

    /// Whole-fetch deadline for one dispatch.
    pub fn whole_fetch_deadline(&self) -> Duration {
        self.max_timeout.min(self.fetch_timeout * 2)
    }

    /// Request concurrency resolved against host resources with a
    /// heuristic ceiling.
    pub fn resolved_concurrency(&self) -> usize {
        self.concurrency
            .unwrap_or_else(|| num_cpus::get().clamp(2, 8))
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// `false`, `0` and `no` (any case) read as false, everything else as
/// true.
fn env_flag(name: &str) -> Option<bool> {
    env_string(name).map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
}

fn env_f64(name: &str) -> Option<f64> {
    let raw = env_string(name)?;
    match raw.parse::<f64>() {
        Ok(v) if v > 0.0 => Some(v),
        _ => {
            warn!(var = name, value = %raw, "ignoring non-positive or unparseable value");
            None
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    let raw = env_string(name)?;
    match raw.parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable value");
            None
        }
    }
}

/// Functionally equivalent REST hosts, rotated to spread rate-limit
/// consumption. Spot has a mirror pool; the futures clusters are single
/// hosts.
pub fn rest_endpoints(provider: Provider, market: MarketType) -> Vec<String> {
    match (provider, market) {
        (Provider::Binance, MarketType::Spot) => vec![
            "https://api.binance.com".to_string(),
            "https://api1.binance.com".to_string(),
            "https://api2.binance.com".to_string(),
            "https://api3.binance.com".to_string(),
            "https://api4.binance.com".to_string(),
        ],
        (Provider::Binance, MarketType::FuturesUsdt) => {
            vec!["https://fapi.binance.com".to_string()]
        }
        (Provider::Binance, MarketType::FuturesCoin) => {
            vec!["https://dapi.binance.com".to_string()]
        }
        (Provider::Okx, _) => vec!["https://www.okx.com".to_string()],
    }
}

/// Kline endpoint path for a Binance market segment.
pub fn binance_kline_path(market: MarketType) -> &'static str {
    match market {
        MarketType::Spot => "/api/v3/klines",
        MarketType::FuturesUsdt => "/fapi/v1/klines",
        MarketType::FuturesCoin => "/dapi/v1/klines",
    }
}

/// Funding-rate endpoint path per futures segment.
pub fn binance_funding_path(market: MarketType) -> &'static str {
    match market {
        MarketType::FuturesCoin => "/dapi/v1/fundingRate",
        _ => "/fapi/v1/fundingRate",
    }
}
