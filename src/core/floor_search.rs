//! Binary searches over time-ordered range sequences.
//!
//! Every function expects `ranges` to be non-decreasing in both `min_ts` and
//! `max_ts`, which holds for anything appended through [`RangeList`]. For
//! point ranges (`min_ts == max_ts`) the floor functions reduce to the usual
//! "largest timestamp <= ts" searches over a sorted sequence with duplicates;
//! ties are resolved purely by position, never by value.
//!
//! [`RangeList`]: crate::core::RangeList

use std::cmp::Ordering;
use std::ops::RangeInclusive;

use crate::core::TimeRange;

/// Highest index whose range starts at or before `ts`.
///
/// Among duplicates equal to the floor timestamp this is the last occurrence.
pub fn find_last_floor(ranges: &[TimeRange], ts: i64) -> Option<usize> {
    ranges.partition_point(|r| r.min_ts <= ts).checked_sub(1)
}

/// Highest index whose range lies entirely before `ts`.
///
/// When some point entry equals `ts` this is the index just before its first
/// occurrence (callers wanting the occurrence itself add one); an exact match
/// at index 0 has no predecessor. When nothing equals `ts` the result is the
/// same as [`find_last_floor`].
pub fn find_first_floor(ranges: &[TimeRange], ts: i64) -> Option<usize> {
    ranges.partition_point(|r| r.compare(ts) == Ordering::Less).checked_sub(1)
}

/// Lowest index whose range contains `ts` or starts after it.
pub fn find_ceil(ranges: &[TimeRange], ts: i64) -> Option<usize> {
    let idx = ranges.partition_point(|r| r.compare(ts) == Ordering::Less);
    (idx < ranges.len()).then_some(idx)
}

/// Lowest index whose range contains `ts`.
pub fn find_first_containing(ranges: &[TimeRange], ts: i64) -> Option<usize> {
    find_ceil(ranges, ts).filter(|&idx| ranges[idx].contains(ts))
}

/// Highest index whose range contains `ts`.
pub fn find_last_containing(ranges: &[TimeRange], ts: i64) -> Option<usize> {
    find_last_floor(ranges, ts).filter(|&idx| ranges[idx].contains(ts))
}

/// Index span of the ranges intersecting `[min_ts, max_ts]`.
///
/// The span is contiguous because both bounds are sorted.
pub fn find_overlapping(
    ranges: &[TimeRange],
    min_ts: i64,
    max_ts: i64,
) -> Option<RangeInclusive<usize>> {
    if min_ts > max_ts {
        return None;
    }
    let first = find_ceil(ranges, min_ts)?;
    let last = find_last_floor(ranges, max_ts)?;
    (first <= last).then_some(first..=last)
}

/// Index span from the last range starting before `min_ts` (or the first
/// range, if none does) through the last range starting at or before `max_ts`.
///
/// Only start times are consulted: the range starting before `min_ts` may
/// still hold records inside the interval whatever its recorded end.
pub fn find_floor_span(
    ranges: &[TimeRange],
    min_ts: i64,
    max_ts: i64,
) -> Option<RangeInclusive<usize>> {
    if min_ts > max_ts {
        return None;
    }
    let last = find_last_floor(ranges, max_ts)?;
    let first = min_ts
        .checked_sub(1)
        .and_then(|bound| find_last_floor(ranges, bound))
        .unwrap_or(0);
    Some(first..=last)
}
