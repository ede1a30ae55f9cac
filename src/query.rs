//! Query vocabulary: providers, markets, chart types and the five-tuple
//! key that addresses one bar series everywhere (cache paths, archive
//! URLs, REST parameters).

use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, ErrorKind, Result};
use crate::interval::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Binance,
    Okx,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Binance => "BINANCE",
            Provider::Okx => "OKX",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BINANCE" => Ok(Provider::Binance),
            "OKX" => Ok(Provider::Okx),
            other => Err(EngineError::new(
                ErrorKind::InvalidRequest,
                format!("unknown provider {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketType {
    Spot,
    FuturesUsdt,
    FuturesCoin,
}

impl MarketType {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketType::Spot => "SPOT",
            MarketType::FuturesUsdt => "FUTURES_USDT",
            MarketType::FuturesCoin => "FUTURES_COIN",
        }
    }

    pub fn is_futures(self) -> bool {
        matches!(self, MarketType::FuturesUsdt | MarketType::FuturesCoin)
    }

    /// Path segment inside the Binance Vision archive tree.
    pub fn vision_segment(self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::FuturesUsdt => "futures/um",
            MarketType::FuturesCoin => "futures/cm",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SPOT" => Ok(MarketType::Spot),
            "FUTURES_USDT" | "USDT" | "UM" => Ok(MarketType::FuturesUsdt),
            "FUTURES_COIN" | "COIN" | "CM" => Ok(MarketType::FuturesCoin),
            other => Err(EngineError::new(
                ErrorKind::InvalidRequest,
                format!("unknown market type {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChartType {
    Klines,
    FundingRate,
}

impl ChartType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChartType::Klines => "KLINES",
            ChartType::FundingRate => "FUNDING_RATE",
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "KLINES" => Ok(ChartType::Klines),
            "FUNDING_RATE" | "FUNDING" => Ok(ChartType::FundingRate),
            other => Err(EngineError::new(
                ErrorKind::InvalidRequest,
                format!("unknown chart type {other:?}"),
            )),
        }
    }
}

/// Which source the caller pins the fetch to, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourcePolicy {
    #[default]
    Auto,
    Cache,
    Vision,
    Rest,
}

impl FromStr for SourcePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(SourcePolicy::Auto),
            "cache" => Ok(SourcePolicy::Cache),
            "vision" => Ok(SourcePolicy::Vision),
            "rest" => Ok(SourcePolicy::Rest),
            other => Err(EngineError::new(
                ErrorKind::InvalidRequest,
                format!("unknown source policy {other:?}"),
            )),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub use_cache: bool,
    pub enforce_source: SourcePolicy,
    /// Keep the per-row source tag on the returned table.
    pub include_source_metadata: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            use_cache: true,
            enforce_source: SourcePolicy::Auto,
            include_source_metadata: false,
        }
    }
}

/// The five-tuple addressing one series. Fully determines a cache
/// directory, an archive URL family and a REST parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub provider: Provider,
    pub chart_type: ChartType,
    pub market_type: MarketType,
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(
        provider: Provider,
        chart_type: ChartType,
        market_type: MarketType,
        symbol: impl Into<String>,
        interval: Interval,
    ) -> Self {
        SeriesKey {
            provider,
            chart_type,
            market_type,
            symbol: symbol.into(),
            interval,
        }
    }

    /// Reject impossible combinations before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::new(ErrorKind::InvalidRequest, "empty symbol"));
        }
        if self.chart_type == ChartType::FundingRate && !self.market_type.is_futures() {
            return Err(EngineError::new(
                ErrorKind::InvalidRequest,
                "funding rates exist only on futures markets",
            )
            .with("market_type", self.market_type)
            .with("symbol", &self.symbol));
        }
        if self.interval == Interval::S1
            && !(self.provider == Provider::Binance && self.market_type == MarketType::Spot)
        {
            return Err(EngineError::new(
                ErrorKind::UnsupportedInterval,
                "1s bars are only available on Binance spot",
            )
            .with("provider", self.provider)
            .with("market_type", self.market_type));
        }
        if self.provider == Provider::Okx
            && self.chart_type == ChartType::Klines
            && self.interval.okx_code().is_none()
        {
            return Err(EngineError::new(
                ErrorKind::UnsupportedInterval,
                format!("OKX has no {} bar", self.interval),
            ));
        }
        Ok(())
    }

    /// Relative cache directory for this series.
    pub fn cache_dir(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.provider,
            self.chart_type,
            self.market_type,
            self.symbol,
            self.interval.code()
        )
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}@{}",
            self.provider, self.chart_type, self.market_type, self.symbol, self.interval
        )
    }
}
