//! Missing-range computation: which aligned bar timestamps inside a
//! requested window are absent from a cached table.

use std::collections::HashSet;

use itertools::Itertools;

use crate::interval::Interval;

/// All aligned open times in `[align_start(start), align_end(end)]`.
pub fn expected_open_times(start: i64, end: i64, interval: Interval) -> Vec<i64> {
    let mut out = Vec::new();
    let mut t = interval.align_start(start);
    let last = interval.align_end(end);
    while t <= last {
        out.push(t);
        t = interval.next_boundary(t);
    }
    out
}

/// Collapse the open times absent from `present` into maximal `[a, b]`
/// runs of consecutive periods. Both ends are inclusive open times, so a
/// single missing bar yields `[t, t]`.
pub fn missing_ranges(
    present: &[i64],
    start: i64,
    end: i64,
    interval: Interval,
) -> Vec<(i64, i64)> {
    let expected = expected_open_times(start, end, interval);
    if expected.is_empty() {
        return Vec::new();
    }
    let have: HashSet<i64> = present.iter().copied().collect();
    let missing: Vec<usize> = expected
        .iter()
        .enumerate()
        .filter(|(_, t)| !have.contains(t))
        .map(|(i, _)| i)
        .collect();

    // Consecutive expected-index runs stay consecutive under (idx - pos).
    let runs = missing
        .iter()
        .enumerate()
        .chunk_by(|&(pos, &idx)| idx - pos);
    let mut out = Vec::new();
    for (_, mut run) in &runs {
        let Some((_, &first)) = run.next() else {
            continue;
        };
        let last = run.last().map(|(_, &idx)| idx).unwrap_or(first);
        out.push((expected[first], expected[last]));
    }
    out
}
