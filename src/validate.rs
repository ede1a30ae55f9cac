//! Post-merge structural checks. Violations are reported, never silently
//! corrected: the engine refuses to hand back structurally wrong data.

use crate::error::{EngineError, ErrorKind, Result};
use crate::interval::Interval;
use crate::table::{FundingTable, KlineTable};

/// Assert the invariants every returned kline table must satisfy:
/// strictly increasing open times, interval-aligned open times, and the
/// close-time identity `close = open + interval - 1µs`.
pub fn check_klines(table: &KlineTable, interval: Interval) -> Result<()> {
    for i in 0..table.len() {
        let open = table.open_time[i];
        if i > 0 && open <= table.open_time[i - 1] {
            return Err(violation("open_time is not strictly increasing")
                .with("row", i)
                .with("open_time", open)
                .with("previous", table.open_time[i - 1]));
        }
        if !interval.is_aligned(open) {
            return Err(violation("open_time is not aligned to the interval")
                .with("row", i)
                .with("open_time", open)
                .with("interval", interval));
        }
        let expected_close = interval.close_of(open);
        if table.close_time[i] != expected_close {
            return Err(violation("close_time does not equal period end minus 1µs")
                .with("row", i)
                .with("close_time", table.close_time[i])
                .with("expected", expected_close));
        }
    }
    Ok(())
}

/// Funding observations carry no fixed grid; the checks are ordering and
/// value sanity.
pub fn check_funding(table: &FundingTable) -> Result<()> {
    for i in 0..table.len() {
        if i > 0 && table.funding_time[i] <= table.funding_time[i - 1] {
            return Err(violation("funding_time is not strictly increasing")
                .with("row", i)
                .with("funding_time", table.funding_time[i]));
        }
        if !table.funding_rate[i].is_finite() {
            return Err(violation("funding_rate is not a finite number")
                .with("row", i)
                .with("funding_time", table.funding_time[i]));
        }
    }
    Ok(())
}

fn violation(message: &str) -> EngineError {
    EngineError::new(ErrorKind::Validation, message)
}
