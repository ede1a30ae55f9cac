//! Bar widths, interval alignment and timestamp-unit handling.
//!
//! All timestamps inside the engine are UTC microseconds (`i64`). Every
//! alignment rule lives here so the archive decoder, the cache key
//! derivation and the REST chunker cannot drift apart.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};

use crate::error::{EngineError, ErrorKind, Result};

pub const MICROS_PER_SEC: i64 = 1_000_000;
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SEC;

/// Monday 1970-01-05 00:00 UTC; Binance weekly bars open on Mondays.
const WEEK_ANCHOR_MICROS: i64 = 4 * MICROS_PER_DAY;

/// Supported bar widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    S1,
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::S1,
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D3,
        Interval::W1,
        Interval::Mo1,
    ];

    /// Binance interval code; also the cache directory segment.
    pub fn code(self) -> &'static str {
        match self {
            Interval::S1 => "1s",
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    /// Fixed duration in seconds; months use the 30-day approximation for
    /// millisecond math (calendar months only matter in alignment).
    pub fn seconds(self) -> i64 {
        match self {
            Interval::S1 => 1,
            Interval::M1 => 60,
            Interval::M3 => 3 * 60,
            Interval::M5 => 5 * 60,
            Interval::M15 => 15 * 60,
            Interval::M30 => 30 * 60,
            Interval::H1 => 3_600,
            Interval::H2 => 2 * 3_600,
            Interval::H4 => 4 * 3_600,
            Interval::H6 => 6 * 3_600,
            Interval::H8 => 8 * 3_600,
            Interval::H12 => 12 * 3_600,
            Interval::D1 => 86_400,
            Interval::D3 => 3 * 86_400,
            Interval::W1 => 7 * 86_400,
            Interval::Mo1 => 30 * 86_400,
        }
    }

    pub fn micros(self) -> i64 {
        self.seconds() * MICROS_PER_SEC
    }

    pub fn millis(self) -> i64 {
        self.seconds() * 1_000
    }

    /// Calendar intervals do not tile the epoch with a fixed modulus.
    pub fn is_calendar(self) -> bool {
        matches!(self, Interval::Mo1)
    }

    /// Weeks are fixed-width but anchored off the epoch (Monday opens).
    fn anchor_micros(self) -> i64 {
        match self {
            Interval::W1 => WEEK_ANCHOR_MICROS,
            _ => 0,
        }
    }

    /// Floor `t` onto the previous (or equal) period boundary.
    pub fn align_end(self, t: i64) -> i64 {
        if self == Interval::Mo1 {
            let dt = micros_to_utc(t);
            let first = NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)
                .unwrap_or_else(|| dt.date_naive());
            return day_start_micros(first);
        }
        let anchor = self.anchor_micros();
        t - (t - anchor).rem_euclid(self.micros())
    }

    /// Ceil `t` onto the next (or equal) period boundary. Mirrors the
    /// provider rule: start times round up, end times round down.
    pub fn align_start(self, t: i64) -> i64 {
        let floored = self.align_end(t);
        if floored == t {
            t
        } else {
            self.next_boundary(floored)
        }
    }

    /// The boundary that follows `boundary`.
    pub fn next_boundary(self, boundary: i64) -> i64 {
        if self == Interval::Mo1 {
            let dt = micros_to_utc(boundary);
            let next = dt
                .date_naive()
                .checked_add_months(Months::new(1))
                .unwrap_or_else(|| dt.date_naive());
            let first = NaiveDate::from_ymd_opt(next.year(), next.month(), 1)
                .unwrap_or(next);
            day_start_micros(first)
        } else {
            boundary + self.micros()
        }
    }

    /// Whether `t` sits exactly on a period boundary.
    pub fn is_aligned(self, t: i64) -> bool {
        self.align_end(t) == t
    }

    /// Half-open period `[start, end)` containing `t`.
    pub fn period_of(self, t: i64) -> (i64, i64) {
        let start = self.align_end(t);
        (start, self.next_boundary(start))
    }

    /// Close time of the bar opening at `open`: period end minus one
    /// microsecond.
    pub fn close_of(self, open: i64) -> i64 {
        self.next_boundary(open) - 1
    }

    /// Extra span cap for REST windows on top of the record cap; the
    /// provider rejects over-large ranges for sub-daily bars.
    pub fn span_cap_micros(self) -> Option<i64> {
        match self {
            Interval::S1 => Some(1_000 * MICROS_PER_SEC),
            Interval::M1 => Some(1_000 * 60 * MICROS_PER_SEC),
            Interval::M3 | Interval::M5 | Interval::M15 | Interval::M30 => {
                Some(7 * MICROS_PER_DAY)
            }
            Interval::H1
            | Interval::H2
            | Interval::H4
            | Interval::H6
            | Interval::H8
            | Interval::H12 => Some(30 * MICROS_PER_DAY),
            _ => None,
        }
    }

    /// OKX bar code: minutes lowercase, hours/days/weeks/months uppercase.
    /// `1s` and `8h` have no OKX equivalent.
    pub fn okx_code(self) -> Option<&'static str> {
        match self {
            Interval::S1 | Interval::H8 => None,
            Interval::M1 => Some("1m"),
            Interval::M3 => Some("3m"),
            Interval::M5 => Some("5m"),
            Interval::M15 => Some("15m"),
            Interval::M30 => Some("30m"),
            Interval::H1 => Some("1H"),
            Interval::H2 => Some("2H"),
            Interval::H4 => Some("4H"),
            Interval::H6 => Some("6H"),
            Interval::H12 => Some("12H"),
            Interval::D1 => Some("1D"),
            Interval::D3 => Some("3D"),
            Interval::W1 => Some("1W"),
            Interval::Mo1 => Some("1M"),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Interval {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let iv = match s {
            "1s" => Interval::S1,
            "1m" => Interval::M1,
            "3m" => Interval::M3,
            "5m" => Interval::M5,
            "15m" => Interval::M15,
            "30m" => Interval::M30,
            "1h" => Interval::H1,
            "2h" => Interval::H2,
            "4h" => Interval::H4,
            "6h" => Interval::H6,
            "8h" => Interval::H8,
            "12h" => Interval::H12,
            "1d" => Interval::D1,
            "3d" => Interval::D3,
            "1w" => Interval::W1,
            "1M" | "1mo" => Interval::Mo1,
            other => {
                return Err(EngineError::new(
                    ErrorKind::UnsupportedInterval,
                    format!("unrecognized interval {other:?}"),
                ));
            }
        };
        Ok(iv)
    }
}

/// Raw timestamp width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampUnit {
    Millis,
    Micros,
}

/// Detect the unit of a raw timestamp by digit width: 13 digits are
/// milliseconds, 16 are microseconds. Anything else is rejected.
pub fn detect_unit(raw: i64) -> Result<TimestampUnit> {
    if (1_000_000_000_000..10_000_000_000_000).contains(&raw) {
        Ok(TimestampUnit::Millis)
    } else if (1_000_000_000_000_000..10_000_000_000_000_000).contains(&raw) {
        Ok(TimestampUnit::Micros)
    } else {
        Err(EngineError::new(
            ErrorKind::TimestampFormat,
            format!("timestamp {raw} is neither 13-digit ms nor 16-digit us"),
        ))
    }
}

pub fn to_micros(raw: i64, unit: TimestampUnit) -> i64 {
    match unit {
        TimestampUnit::Millis => raw * 1_000,
        TimestampUnit::Micros => raw,
    }
}

pub fn micros_to_utc(t: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(t).unwrap_or_default()
}

pub fn utc_date_of(t: i64) -> NaiveDate {
    micros_to_utc(t).date_naive()
}

pub fn day_start_micros(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_micros()
}

/// Half-open UTC day bounds `[00:00, 24:00)` in microseconds.
pub fn day_bounds_micros(date: NaiveDate) -> (i64, i64) {
    let start = day_start_micros(date);
    (start, start + MICROS_PER_DAY)
}

/// All UTC dates whose day intersects `[start, end]` (inclusive micros).
pub fn dates_overlapping(start: i64, end: i64) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    if end < start {
        return dates;
    }
    let mut d = utc_date_of(start);
    let last = utc_date_of(end);
    while d <= last {
        dates.push(d);
        match d.succ_opt() {
            Some(next) => d = next,
            None => break,
        }
    }
    dates
}
