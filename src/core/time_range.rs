use std::cmp::Ordering;

/// Upper bound stored for an entry whose end is not known yet: until it is
/// closed the entry covers every timestamp from its start on.
pub const OPEN_MAX_TS: i64 = i64::MAX;

/// Closed timestamp interval `[min_ts, max_ts]` mapped to an opaque value.
///
/// Leaf ranges carry an append position, internal ranges carry the address of
/// the child subtree they summarize. Point entries use `min_ts == max_ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub min_ts: i64,
    pub max_ts: i64,
    pub value: i64,
}

impl TimeRange {
    pub const fn new(min_ts: i64, max_ts: i64, value: i64) -> Self {
        Self {
            min_ts,
            max_ts,
            value,
        }
    }

    pub const fn point(ts: i64, value: i64) -> Self {
        Self::new(ts, ts, value)
    }

    /// Range starting at `min_ts` whose end is not known yet.
    pub const fn open(min_ts: i64, value: i64) -> Self {
        Self::new(min_ts, OPEN_MAX_TS, value)
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.min_ts <= ts && ts <= self.max_ts
    }

    /// Position of this range relative to `ts`: `Less` if the range ends
    /// before `ts`, `Equal` if it contains `ts`, `Greater` if it starts after.
    pub fn compare(&self, ts: i64) -> Ordering {
        if self.max_ts < ts {
            Ordering::Less
        } else if self.min_ts > ts {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}
