//! Typed columnar tables for bar data.
//!
//! One fixed record shape per chart type, stored as column vectors and
//! ordered by open time. The transient per-row source tag used during
//! composition lives in a side column that is stripped at the boundary,
//! so the schema handed back to callers is identical no matter which mix
//! of sources produced the rows.

use chrono::NaiveDate;

use crate::error::{EngineError, ErrorKind, Result};
use crate::interval::utc_date_of;
use crate::query::ChartType;

/// Where a row came from. Lower precedence wins when merging duplicate
/// timestamps: validated cache rows outrank archive rows, which outrank
/// live REST rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataSource {
    Cache,
    Vision,
    Rest,
}

impl DataSource {
    pub fn precedence(self) -> u8 {
        match self {
            DataSource::Cache => 0,
            DataSource::Vision => 1,
            DataSource::Rest => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Cache => "CACHE",
            DataSource::Vision => "VISION",
            DataSource::Rest => "REST",
        }
    }
}

/// One OHLCV bar in canonical column order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KlineRow {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_asset_volume: f64,
    pub count: i64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub ignore: f64,
}

/// Column-major kline table ordered by `open_time`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KlineTable {
    pub open_time: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub close_time: Vec<i64>,
    pub quote_asset_volume: Vec<f64>,
    pub count: Vec<i64>,
    pub taker_buy_volume: Vec<f64>,
    pub taker_buy_quote_volume: Vec<f64>,
    pub ignore: Vec<f64>,
    /// Transient source tags; `None` once stripped or never attached.
    pub source: Option<Vec<DataSource>>,
}

impl KlineTable {
    pub fn new() -> Self {
        KlineTable::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        KlineTable {
            open_time: Vec::with_capacity(n),
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
            close_time: Vec::with_capacity(n),
            quote_asset_volume: Vec::with_capacity(n),
            count: Vec::with_capacity(n),
            taker_buy_volume: Vec::with_capacity(n),
            taker_buy_quote_volume: Vec::with_capacity(n),
            ignore: Vec::with_capacity(n),
            source: None,
        }
    }

    pub fn len(&self) -> usize {
        self.open_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_time.is_empty()
    }

    pub fn push(&mut self, row: KlineRow) {
        debug_assert!(self.source.is_none(), "push into a tagged table");
        self.open_time.push(row.open_time);
        self.open.push(row.open);
        self.high.push(row.high);
        self.low.push(row.low);
        self.close.push(row.close);
        self.volume.push(row.volume);
        self.close_time.push(row.close_time);
        self.quote_asset_volume.push(row.quote_asset_volume);
        self.count.push(row.count);
        self.taker_buy_volume.push(row.taker_buy_volume);
        self.taker_buy_quote_volume.push(row.taker_buy_quote_volume);
        self.ignore.push(row.ignore);
    }

    pub fn row(&self, i: usize) -> KlineRow {
        KlineRow {
            open_time: self.open_time[i],
            open: self.open[i],
            high: self.high[i],
            low: self.low[i],
            close: self.close[i],
            volume: self.volume[i],
            close_time: self.close_time[i],
            quote_asset_volume: self.quote_asset_volume[i],
            count: self.count[i],
            taker_buy_volume: self.taker_buy_volume[i],
            taker_buy_quote_volume: self.taker_buy_quote_volume[i],
            ignore: self.ignore[i],
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = KlineRow> + '_ {
        (0..self.len()).map(|i| self.row(i))
    }

    pub fn first_open_time(&self) -> Option<i64> {
        self.open_time.first().copied()
    }

    pub fn last_open_time(&self) -> Option<i64> {
        self.open_time.last().copied()
    }

    /// Tag every row with `source`, replacing any previous tags.
    pub fn tag_source(&mut self, source: DataSource) {
        self.source = Some(vec![source; self.len()]);
    }

    pub fn strip_source(&mut self) {
        self.source = None;
    }

    pub fn source_of(&self, i: usize) -> Option<DataSource> {
        self.source.as_ref().map(|s| s[i])
    }

    /// Append all rows of `other`, keeping source tags only when both
    /// sides carry them.
    pub fn append(&mut self, mut other: KlineTable) {
        let merged_source = match (self.source.take(), other.source.take()) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            (None, None) => None,
            // An empty side adopts the other side's tags.
            (None, Some(b)) if self.open_time.is_empty() => Some(b),
            (Some(a), None) if other.open_time.is_empty() => Some(a),
            _ => {
                debug_assert!(false, "appending tagged and untagged tables");
                None
            }
        };
        self.open_time.append(&mut other.open_time);
        self.open.append(&mut other.open);
        self.high.append(&mut other.high);
        self.low.append(&mut other.low);
        self.close.append(&mut other.close);
        self.volume.append(&mut other.volume);
        self.close_time.append(&mut other.close_time);
        self.quote_asset_volume.append(&mut other.quote_asset_volume);
        self.count.append(&mut other.count);
        self.taker_buy_volume.append(&mut other.taker_buy_volume);
        self.taker_buy_quote_volume
            .append(&mut other.taker_buy_quote_volume);
        self.ignore.append(&mut other.ignore);
        self.source = merged_source;
    }

    /// Rebuild the table from the given row indices, in order.
    fn take(&self, indices: &[usize]) -> KlineTable {
        let mut out = KlineTable::with_capacity(indices.len());
        for &i in indices {
            out.open_time.push(self.open_time[i]);
            out.open.push(self.open[i]);
            out.high.push(self.high[i]);
            out.low.push(self.low[i]);
            out.close.push(self.close[i]);
            out.volume.push(self.volume[i]);
            out.close_time.push(self.close_time[i]);
            out.quote_asset_volume.push(self.quote_asset_volume[i]);
            out.count.push(self.count[i]);
            out.taker_buy_volume.push(self.taker_buy_volume[i]);
            out.taker_buy_quote_volume
                .push(self.taker_buy_quote_volume[i]);
            out.ignore.push(self.ignore[i]);
        }
        if let Some(src) = &self.source {
            out.source = Some(indices.iter().map(|&i| src[i]).collect());
        }
        out
    }

    /// Sort by open time and drop duplicate timestamps, preferring the
    /// source with the lowest precedence number. Untagged rows rank last.
    pub fn sort_and_dedupe(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&i| {
            let prec = self.source_of(i).map(|s| s.precedence()).unwrap_or(u8::MAX);
            (self.open_time[i], prec, i)
        });
        let mut keep = Vec::with_capacity(order.len());
        let mut last_time: Option<i64> = None;
        for i in order {
            if last_time != Some(self.open_time[i]) {
                keep.push(i);
                last_time = Some(self.open_time[i]);
            }
        }
        *self = self.take(&keep);
    }

    /// Rows with `start <= open_time <= end`.
    pub fn slice_range(&self, start: i64, end: i64) -> KlineTable {
        let indices: Vec<usize> = (0..self.len())
            .filter(|&i| self.open_time[i] >= start && self.open_time[i] <= end)
            .collect();
        self.take(&indices)
    }

    /// Merge any number of tables: concatenate, sort, dedupe by source
    /// precedence. Associative and idempotent for fixed inputs.
    pub fn merge(tables: impl IntoIterator<Item = KlineTable>) -> KlineTable {
        let mut out = KlineTable::new();
        for t in tables {
            out.append(t);
        }
        out.sort_and_dedupe();
        out
    }

    /// Split into per-UTC-day tables keyed by the open-time date, in
    /// ascending date order. Tags are dropped; day shards persist the
    /// canonical schema only.
    pub fn partition_by_day(&self) -> Vec<(NaiveDate, KlineTable)> {
        let mut out: Vec<(NaiveDate, KlineTable)> = Vec::new();
        for i in 0..self.len() {
            let date = utc_date_of(self.open_time[i]);
            match out.last_mut() {
                Some((d, t)) if *d == date => t.push(self.row(i)),
                _ => {
                    let mut t = KlineTable::new();
                    t.push(self.row(i));
                    out.push((date, t));
                }
            }
        }
        out.sort_by_key(|(d, _)| *d);
        out
    }
}

/// One funding-rate observation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FundingRow {
    pub funding_time: i64,
    pub symbol: String,
    pub funding_rate: f64,
    pub mark_price: f64,
}

/// Column-major funding-rate table ordered by `funding_time`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FundingTable {
    pub funding_time: Vec<i64>,
    pub symbol: Vec<String>,
    pub funding_rate: Vec<f64>,
    pub mark_price: Vec<f64>,
    pub source: Option<Vec<DataSource>>,
}

impl FundingTable {
    pub fn new() -> Self {
        FundingTable::default()
    }

    pub fn len(&self) -> usize {
        self.funding_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funding_time.is_empty()
    }

    pub fn push(&mut self, row: FundingRow) {
        debug_assert!(self.source.is_none(), "push into a tagged table");
        self.funding_time.push(row.funding_time);
        self.symbol.push(row.symbol);
        self.funding_rate.push(row.funding_rate);
        self.mark_price.push(row.mark_price);
    }

    pub fn row(&self, i: usize) -> FundingRow {
        FundingRow {
            funding_time: self.funding_time[i],
            symbol: self.symbol[i].clone(),
            funding_rate: self.funding_rate[i],
            mark_price: self.mark_price[i],
        }
    }

    pub fn first_time(&self) -> Option<i64> {
        self.funding_time.first().copied()
    }

    pub fn last_time(&self) -> Option<i64> {
        self.funding_time.last().copied()
    }

    pub fn tag_source(&mut self, source: DataSource) {
        self.source = Some(vec![source; self.len()]);
    }

    pub fn strip_source(&mut self) {
        self.source = None;
    }

    fn source_of(&self, i: usize) -> Option<DataSource> {
        self.source.as_ref().map(|s| s[i])
    }

    pub fn append(&mut self, mut other: FundingTable) {
        let merged_source = match (self.source.take(), other.source.take()) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            (None, None) => None,
            // An empty side adopts the other side's tags.
            (None, Some(b)) if self.funding_time.is_empty() => Some(b),
            (Some(a), None) if other.funding_time.is_empty() => Some(a),
            _ => {
                debug_assert!(false, "appending tagged and untagged tables");
                None
            }
        };
        self.funding_time.append(&mut other.funding_time);
        self.symbol.append(&mut other.symbol);
        self.funding_rate.append(&mut other.funding_rate);
        self.mark_price.append(&mut other.mark_price);
        self.source = merged_source;
    }

    fn take(&self, indices: &[usize]) -> FundingTable {
        let mut out = FundingTable::new();
        for &i in indices {
            out.funding_time.push(self.funding_time[i]);
            out.symbol.push(self.symbol[i].clone());
            out.funding_rate.push(self.funding_rate[i]);
            out.mark_price.push(self.mark_price[i]);
        }
        if let Some(src) = &self.source {
            out.source = Some(indices.iter().map(|&i| src[i]).collect());
        }
        out
    }

    pub fn sort_and_dedupe(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&i| {
            let prec = self.source_of(i).map(|s| s.precedence()).unwrap_or(u8::MAX);
            (self.funding_time[i], prec, i)
        });
        let mut keep = Vec::with_capacity(order.len());
        let mut last_time: Option<i64> = None;
        for i in order {
            if last_time != Some(self.funding_time[i]) {
                keep.push(i);
                last_time = Some(self.funding_time[i]);
            }
        }
        *self = self.take(&keep);
    }

    pub fn slice_range(&self, start: i64, end: i64) -> FundingTable {
        let indices: Vec<usize> = (0..self.len())
            .filter(|&i| self.funding_time[i] >= start && self.funding_time[i] <= end)
            .collect();
        self.take(&indices)
    }

    pub fn merge(tables: impl IntoIterator<Item = FundingTable>) -> FundingTable {
        let mut out = FundingTable::new();
        for t in tables {
            out.append(t);
        }
        out.sort_and_dedupe();
        out
    }

    pub fn partition_by_day(&self) -> Vec<(NaiveDate, FundingTable)> {
        let mut out: Vec<(NaiveDate, FundingTable)> = Vec::new();
        for i in 0..self.len() {
            let date = utc_date_of(self.funding_time[i]);
            match out.last_mut() {
                Some((d, t)) if *d == date => t.push(self.row(i)),
                _ => {
                    let mut t = FundingTable::new();
                    t.push(self.row(i));
                    out.push((date, t));
                }
            }
        }
        out.sort_by_key(|(d, _)| *d);
        out
    }
}

/// The single tabular shape the engine hands back: klines or funding
/// rates, identical schema per chart type regardless of source mix.
#[derive(Debug, Clone, PartialEq)]
pub enum Table {
    Klines(KlineTable),
    Funding(FundingTable),
}

impl Table {
    pub fn chart_type(&self) -> ChartType {
        match self {
            Table::Klines(_) => ChartType::Klines,
            Table::Funding(_) => ChartType::FundingRate,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Table::Klines(t) => t.len(),
            Table::Funding(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn strip_source(&mut self) {
        match self {
            Table::Klines(t) => t.strip_source(),
            Table::Funding(t) => t.strip_source(),
        }
    }

    pub fn as_klines(&self) -> Result<&KlineTable> {
        match self {
            Table::Klines(t) => Ok(t),
            Table::Funding(_) => Err(EngineError::new(
                ErrorKind::SchemaMismatch,
                "expected a kline table, got funding rates",
            )),
        }
    }

    pub fn as_funding(&self) -> Result<&FundingTable> {
        match self {
            Table::Funding(t) => Ok(t),
            Table::Klines(_) => Err(EngineError::new(
                ErrorKind::SchemaMismatch,
                "expected a funding table, got klines",
            )),
        }
    }

    pub fn into_klines(self) -> Result<KlineTable> {
        match self {
            Table::Klines(t) => Ok(t),
            Table::Funding(_) => Err(EngineError::new(
                ErrorKind::SchemaMismatch,
                "expected a kline table, got funding rates",
            )),
        }
    }

    pub fn into_funding(self) -> Result<FundingTable> {
        match self {
            Table::Funding(t) => Ok(t),
            Table::Klines(_) => Err(EngineError::new(
                ErrorKind::SchemaMismatch,
                "expected a funding table, got klines",
            )),
        }
    }
}
