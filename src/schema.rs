//! Canonical column sets per chart type, Arrow IPC interop for day
//! shards, and coercion of raw wire records into typed rows.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;

use crate::error::{EngineError, ErrorKind, Result};
use crate::interval::{TimestampUnit, to_micros};
use crate::query::ChartType;
use crate::table::{FundingRow, FundingTable, KlineRow, KlineTable, Table};

/// Canonical kline columns, in on-disk and on-wire order.
pub const KLINE_COLUMNS: [&str; 12] = [
    "open_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "close_time",
    "quote_asset_volume",
    "count",
    "taker_buy_volume",
    "taker_buy_quote_volume",
    "ignore",
];

/// Canonical funding-rate columns.
pub const FUNDING_COLUMNS: [&str; 4] = ["funding_time", "symbol", "funding_rate", "mark_price"];

pub fn column_names(chart_type: ChartType) -> &'static [&'static str] {
    match chart_type {
        ChartType::Klines => &KLINE_COLUMNS,
        ChartType::FundingRate => &FUNDING_COLUMNS,
    }
}

fn micros_utc() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

pub fn kline_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("open_time", micros_utc(), false),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Float64, false),
        Field::new("close_time", micros_utc(), false),
        Field::new("quote_asset_volume", DataType::Float64, false),
        Field::new("count", DataType::Int64, false),
        Field::new("taker_buy_volume", DataType::Float64, false),
        Field::new("taker_buy_quote_volume", DataType::Float64, false),
        Field::new("ignore", DataType::Float64, false),
    ]))
}

pub fn funding_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("funding_time", micros_utc(), false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("funding_rate", DataType::Float64, false),
        Field::new("mark_price", DataType::Float64, false),
    ]))
}

fn io_err(err: ArrowError) -> EngineError {
    EngineError::new(ErrorKind::CacheIo, err.to_string())
}

fn ts_array(values: &[i64]) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(values.to_vec()).with_timezone("UTC"))
}

/// Serialize a kline table to Arrow IPC file bytes. The transient source
/// tag is never persisted.
pub fn kline_to_ipc(table: &KlineTable) -> Result<Vec<u8>> {
    let schema = kline_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            ts_array(&table.open_time),
            Arc::new(Float64Array::from(table.open.clone())),
            Arc::new(Float64Array::from(table.high.clone())),
            Arc::new(Float64Array::from(table.low.clone())),
            Arc::new(Float64Array::from(table.close.clone())),
            Arc::new(Float64Array::from(table.volume.clone())),
            ts_array(&table.close_time),
            Arc::new(Float64Array::from(table.quote_asset_volume.clone())),
            Arc::new(Int64Array::from(table.count.clone())),
            Arc::new(Float64Array::from(table.taker_buy_volume.clone())),
            Arc::new(Float64Array::from(table.taker_buy_quote_volume.clone())),
            Arc::new(Float64Array::from(table.ignore.clone())),
        ],
    )
    .map_err(io_err)?;
    let mut writer = FileWriter::try_new(Vec::new(), &schema).map_err(io_err)?;
    writer.write(&batch).map_err(io_err)?;
    writer.finish().map_err(io_err)?;
    writer.into_inner().map_err(io_err)
}

pub fn funding_to_ipc(table: &FundingTable) -> Result<Vec<u8>> {
    let schema = funding_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            ts_array(&table.funding_time),
            Arc::new(StringArray::from(table.symbol.clone())),
            Arc::new(Float64Array::from(table.funding_rate.clone())),
            Arc::new(Float64Array::from(table.mark_price.clone())),
        ],
    )
    .map_err(io_err)?;
    let mut writer = FileWriter::try_new(Vec::new(), &schema).map_err(io_err)?;
    writer.write(&batch).map_err(io_err)?;
    writer.finish().map_err(io_err)?;
    writer.into_inner().map_err(io_err)
}

fn schema_matches(found: &Schema, expected: &Schema) -> bool {
    found.fields().len() == expected.fields().len()
        && found
            .fields()
            .iter()
            .zip(expected.fields())
            .all(|(a, b)| a.name() == b.name() && a.data_type() == b.data_type())
}

fn downcast_ts<'a>(batch: &'a RecordBatch, idx: usize) -> Result<&'a TimestampMicrosecondArray> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| column_type_mismatch(idx))
}

fn downcast_f64<'a>(batch: &'a RecordBatch, idx: usize) -> Result<&'a Float64Array> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| column_type_mismatch(idx))
}

fn downcast_i64<'a>(batch: &'a RecordBatch, idx: usize) -> Result<&'a Int64Array> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| column_type_mismatch(idx))
}

fn column_type_mismatch(idx: usize) -> EngineError {
    EngineError::new(
        ErrorKind::SchemaMismatch,
        format!("column {idx} has an unexpected physical type"),
    )
}

/// Deserialize Arrow IPC file bytes into a kline table, verifying the
/// stored schema against the canonical one.
pub fn kline_from_ipc(bytes: &[u8]) -> Result<KlineTable> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| EngineError::new(ErrorKind::CacheIo, e.to_string()))?;
    if !schema_matches(&reader.schema(), &kline_schema()) {
        return Err(EngineError::new(
            ErrorKind::SchemaMismatch,
            "day shard schema does not match the canonical kline schema",
        ));
    }
    let mut table = KlineTable::new();
    for batch in reader {
        let batch = batch.map_err(io_err)?;
        let open_time = downcast_ts(&batch, 0)?;
        let open = downcast_f64(&batch, 1)?;
        let high = downcast_f64(&batch, 2)?;
        let low = downcast_f64(&batch, 3)?;
        let close = downcast_f64(&batch, 4)?;
        let volume = downcast_f64(&batch, 5)?;
        let close_time = downcast_ts(&batch, 6)?;
        let quote = downcast_f64(&batch, 7)?;
        let count = downcast_i64(&batch, 8)?;
        let taker_buy = downcast_f64(&batch, 9)?;
        let taker_buy_quote = downcast_f64(&batch, 10)?;
        let ignore = downcast_f64(&batch, 11)?;
        for i in 0..batch.num_rows() {
            table.push(KlineRow {
                open_time: open_time.value(i),
                open: open.value(i),
                high: high.value(i),
                low: low.value(i),
                close: close.value(i),
                volume: volume.value(i),
                close_time: close_time.value(i),
                quote_asset_volume: quote.value(i),
                count: count.value(i),
                taker_buy_volume: taker_buy.value(i),
                taker_buy_quote_volume: taker_buy_quote.value(i),
                ignore: ignore.value(i),
            });
        }
    }
    Ok(table)
}

pub fn funding_from_ipc(bytes: &[u8]) -> Result<FundingTable> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| EngineError::new(ErrorKind::CacheIo, e.to_string()))?;
    if !schema_matches(&reader.schema(), &funding_schema()) {
        return Err(EngineError::new(
            ErrorKind::SchemaMismatch,
            "day shard schema does not match the canonical funding schema",
        ));
    }
    let mut table = FundingTable::new();
    for batch in reader {
        let batch = batch.map_err(io_err)?;
        let funding_time = downcast_ts(&batch, 0)?;
        let symbol = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| column_type_mismatch(1))?;
        let rate = downcast_f64(&batch, 2)?;
        let mark = downcast_f64(&batch, 3)?;
        for i in 0..batch.num_rows() {
            table.push(FundingRow {
                funding_time: funding_time.value(i),
                symbol: symbol.value(i).to_string(),
                funding_rate: rate.value(i),
                mark_price: mark.value(i),
            });
        }
    }
    Ok(table)
}

pub fn table_to_ipc(table: &Table) -> Result<Vec<u8>> {
    match table {
        Table::Klines(t) => kline_to_ipc(t),
        Table::Funding(t) => funding_to_ipc(t),
    }
}

pub fn table_from_ipc(chart_type: ChartType, bytes: &[u8]) -> Result<Table> {
    match chart_type {
        ChartType::Klines => Ok(Table::Klines(kline_from_ipc(bytes)?)),
        ChartType::FundingRate => Ok(Table::Funding(funding_from_ipc(bytes)?)),
    }
}

fn parse_i64(field: &str, name: &str) -> Result<i64> {
    field
        .trim()
        .parse::<i64>()
        .or_else(|_| field.trim().parse::<f64>().map(|v| v as i64))
        .map_err(|_| {
            EngineError::new(
                ErrorKind::ProtocolFormat,
                format!("{name} {field:?} is not an integer"),
            )
        })
}

fn parse_f64(field: &str, name: &str) -> Result<f64> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Ok(f64::NAN);
    }
    trimmed.parse::<f64>().map_err(|_| {
        EngineError::new(
            ErrorKind::ProtocolFormat,
            format!("{name} {field:?} is not a number"),
        )
    })
}

/// Coerce one archive CSV record into a typed row. Both timestamps use
/// the unit detected from the file's first data row; open times are
/// never shifted.
pub fn kline_row_from_csv(rec: &csv::StringRecord, unit: TimestampUnit) -> Result<KlineRow> {
    if rec.len() != KLINE_COLUMNS.len() {
        return Err(EngineError::new(
            ErrorKind::SchemaMismatch,
            format!(
                "expected {} columns, got {}",
                KLINE_COLUMNS.len(),
                rec.len()
            ),
        ));
    }
    Ok(KlineRow {
        open_time: to_micros(parse_i64(&rec[0], "open_time")?, unit),
        open: parse_f64(&rec[1], "open")?,
        high: parse_f64(&rec[2], "high")?,
        low: parse_f64(&rec[3], "low")?,
        close: parse_f64(&rec[4], "close")?,
        volume: parse_f64(&rec[5], "volume")?,
        close_time: to_micros(parse_i64(&rec[6], "close_time")?, unit),
        quote_asset_volume: parse_f64(&rec[7], "quote_asset_volume")?,
        count: parse_i64(&rec[8], "count")?,
        taker_buy_volume: parse_f64(&rec[9], "taker_buy_volume")?,
        taker_buy_quote_volume: parse_f64(&rec[10], "taker_buy_quote_volume")?,
        ignore: parse_f64(&rec[11], "ignore")?,
    })
}

/// Canonicalize close times to `open_time + interval - 1µs`. Provider
/// close stamps come at millisecond resolution and would otherwise differ
/// between archive and REST rows for the same bar.
pub fn normalize_close_times(table: &mut KlineTable, interval: crate::interval::Interval) {
    for i in 0..table.open_time.len() {
        table.close_time[i] = interval.close_of(table.open_time[i]);
    }
}

fn json_i64(value: &serde_json::Value, name: &str) -> Result<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| {
            EngineError::new(
                ErrorKind::ProtocolFormat,
                format!("{name} {value} is not an integer"),
            )
        })
}

fn json_f64(value: &serde_json::Value, name: &str) -> Result<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| {
            EngineError::new(
                ErrorKind::ProtocolFormat,
                format!("{name} {value} is not a number"),
            )
        })
}

/// Coerce one REST kline entry (the provider's 12-element array, with
/// millisecond timestamps) into a typed row.
pub fn kline_row_from_json(value: &serde_json::Value) -> Result<KlineRow> {
    let arr = value.as_array().ok_or_else(|| {
        EngineError::new(ErrorKind::ProtocolFormat, "kline entry is not an array")
    })?;
    if arr.len() < KLINE_COLUMNS.len() {
        return Err(EngineError::new(
            ErrorKind::SchemaMismatch,
            format!("expected {} kline fields, got {}", KLINE_COLUMNS.len(), arr.len()),
        ));
    }
    Ok(KlineRow {
        open_time: to_micros(json_i64(&arr[0], "open_time")?, TimestampUnit::Millis),
        open: json_f64(&arr[1], "open")?,
        high: json_f64(&arr[2], "high")?,
        low: json_f64(&arr[3], "low")?,
        close: json_f64(&arr[4], "close")?,
        volume: json_f64(&arr[5], "volume")?,
        close_time: to_micros(json_i64(&arr[6], "close_time")?, TimestampUnit::Millis),
        quote_asset_volume: json_f64(&arr[7], "quote_asset_volume")?,
        count: json_i64(&arr[8], "count")?,
        taker_buy_volume: json_f64(&arr[9], "taker_buy_volume")?,
        taker_buy_quote_volume: json_f64(&arr[10], "taker_buy_quote_volume")?,
        ignore: json_f64(&arr[11], "ignore")?,
    })
}
