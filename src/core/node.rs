//! Fixed-capacity, append-only index nodes.
//!
//! A node owns two range lists: `pointers` summarize child subtrees and
//! `entries` hold leaf data. Which one is live is decided by the node's
//! [`NodeRole`] for its whole lifetime. Written slots are never modified,
//! except that an entry appended open gets its end exactly once, so readers
//! only ever observe a prefix of what the writer has appended.

use std::fmt;
use std::ops::RangeInclusive;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use crate::core::config::IndexConfig;
use crate::core::floor_search;
use crate::core::{Error, Result, TimeRange};

/// Address of a node: the owning index plus its post-order position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub owner_id: u64,
    pub address: u64,
}

impl NodeId {
    pub const fn new(owner_id: u64, address: u64) -> Self {
        Self { owner_id, address }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Holds entry ranges only.
    Leaf,
    /// Holds pointer ranges only, one per child subtree.
    Internal,
}

impl NodeRole {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            NodeRole::Leaf => 0,
            NodeRole::Internal => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(NodeRole::Leaf),
            1 => Some(NodeRole::Internal),
            _ => None,
        }
    }
}

/// Everything a node store needs to materialize a node it has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub role: NodeRole,
    pub pointer_capacity: usize,
    pub entry_capacity: usize,
}

impl NodeLayout {
    pub fn leaf(config: &IndexConfig) -> Self {
        Self::with_role(NodeRole::Leaf, config)
    }

    pub fn internal(config: &IndexConfig) -> Self {
        Self::with_role(NodeRole::Internal, config)
    }

    pub fn with_role(role: NodeRole, config: &IndexConfig) -> Self {
        Self {
            role,
            pointer_capacity: config.arity,
            entry_capacity: config.entries_per_node,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slots {
    ranges: Vec<TimeRange>,
    /// The last range was appended without an end; see [`RangeList::append_open`].
    last_open: bool,
}

/// Bounded, append-only list of time ranges sorted by both bounds.
#[derive(Debug)]
pub struct RangeList {
    slots: RwLock<Slots>,
    capacity: usize,
}

impl Clone for RangeList {
    fn clone(&self) -> Self {
        Self {
            slots: RwLock::new(self.slots.read().clone()),
            capacity: self.capacity,
        }
    }
}

impl RangeList {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.read().ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().ranges.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// True while the last range still waits for [`close_last`](Self::close_last).
    pub fn has_open(&self) -> bool {
        self.slots.read().last_open
    }

    /// Appends a range after the last one.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: `min_ts > max_ts`, either bound is below
    ///   the corresponding bound of the last range, or the last range is open
    /// - `Error::CapacityExceeded`: the list is full
    pub fn append(&self, range: TimeRange) -> Result<()> {
        if range.min_ts > range.max_ts {
            return Err(Error::invalid_argument(format!(
                "range min {} is greater than max {}",
                range.min_ts, range.max_ts
            )));
        }
        self.push(range, false)
    }

    /// Appends a range whose end is not known yet. Until
    /// [`close_last`](Self::close_last) it covers everything from `min_ts` on.
    pub fn append_open(&self, min_ts: i64, value: i64) -> Result<()> {
        self.push(TimeRange::open(min_ts, value), true)
    }

    fn push(&self, range: TimeRange, open: bool) -> Result<()> {
        let mut slots = self.slots.write();
        if slots.last_open {
            return Err(Error::invalid_argument("last range is still open"));
        }
        if slots.ranges.len() >= self.capacity {
            return Err(Error::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if let Some(last) = slots.ranges.last() {
            if range.max_ts < last.max_ts || range.min_ts < last.min_ts {
                return Err(Error::invalid_argument(format!(
                    "range [{}, {}] goes back before last range [{}, {}]",
                    range.min_ts, range.max_ts, last.min_ts, last.max_ts
                )));
            }
        }
        slots.ranges.push(range);
        slots.last_open = open;
        Ok(())
    }

    /// Sets the end of the open last range, returning the closed range.
    ///
    /// This is the only write that touches an existing slot, and it happens
    /// at most once per slot.
    pub fn close_last(&self, max_ts: i64) -> Result<TimeRange> {
        let mut slots = self.slots.write();
        if !slots.last_open {
            return Err(Error::invalid_argument("no open range to close"));
        }
        let floor = match slots.ranges.len() {
            0 => return Err(Error::Corrupt("open flag set on an empty list")),
            1 => i64::MIN,
            len => slots.ranges[len - 2].max_ts,
        };
        let Some(last) = slots.ranges.last_mut() else {
            return Err(Error::Corrupt("open flag set on an empty list"));
        };
        if max_ts < last.min_ts || max_ts < floor {
            return Err(Error::invalid_argument(format!(
                "range end {} precedes its start {} or the previous end {}",
                max_ts, last.min_ts, floor
            )));
        }
        last.max_ts = max_ts;
        let closed = *last;
        slots.last_open = false;
        Ok(closed)
    }

    /// Read-only view of the ranges appended so far.
    ///
    /// The length is fixed for the lifetime of the view; a concurrent append
    /// waits until the view is dropped.
    pub fn snapshot(&self) -> MappedRwLockReadGuard<'_, [TimeRange]> {
        RwLockReadGuard::map(self.slots.read(), |slots| slots.ranges.as_slice())
    }

    pub fn to_vec(&self) -> Vec<TimeRange> {
        self.snapshot().to_vec()
    }

    pub fn get(&self, idx: usize) -> Option<TimeRange> {
        self.snapshot().get(idx).copied()
    }

    pub fn first(&self) -> Option<TimeRange> {
        self.snapshot().first().copied()
    }

    pub fn last(&self) -> Option<TimeRange> {
        self.snapshot().last().copied()
    }

    /// Lowest index whose range contains `ts`.
    pub fn find_first(&self, ts: i64) -> Option<usize> {
        floor_search::find_first_containing(&self.snapshot(), ts)
    }

    /// Highest index whose range contains `ts`.
    pub fn find_last(&self, ts: i64) -> Option<usize> {
        floor_search::find_last_containing(&self.snapshot(), ts)
    }

    /// Values of every range containing `ts`, in ascending index order.
    pub fn find_all(&self, ts: i64) -> Option<Vec<i64>> {
        let ranges = self.snapshot();
        let first = floor_search::find_first_containing(&ranges, ts)?;
        let last = floor_search::find_last_containing(&ranges, ts)?;
        Some(ranges[first..=last].iter().map(|r| r.value).collect())
    }

    pub fn find_last_floor(&self, ts: i64) -> Option<usize> {
        floor_search::find_last_floor(&self.snapshot(), ts)
    }

    pub fn find_first_floor(&self, ts: i64) -> Option<usize> {
        floor_search::find_first_floor(&self.snapshot(), ts)
    }

    pub fn find_overlapping(&self, min_ts: i64, max_ts: i64) -> Option<RangeInclusive<usize>> {
        floor_search::find_overlapping(&self.snapshot(), min_ts, max_ts)
    }

    /// Values of the ranges intersecting `[min_ts, max_ts]`, newest first.
    pub fn find_all_between(&self, min_ts: i64, max_ts: i64) -> Option<Vec<i64>> {
        let ranges = self.snapshot();
        let span = floor_search::find_overlapping(&ranges, min_ts, max_ts)?;
        Some(ranges[span].iter().rev().map(|r| r.value).collect())
    }

    /// Values of the ranges starting in `[min_ts, max_ts]` plus the last one
    /// starting before `min_ts`, newest first: a segment that starts before
    /// the interval may still hold records inside it.
    pub fn find_all_floor_based(&self, min_ts: i64, max_ts: i64) -> Option<Vec<i64>> {
        let ranges = self.snapshot();
        let span = floor_search::find_floor_span(&ranges, min_ts, max_ts)?;
        Some(ranges[span].iter().rev().map(|r| r.value).collect())
    }
}

/// One node of a post-order heap index.
///
/// Cloning copies the ranges, which lets a writer stage a change and persist
/// it before the shared node shows it.
#[derive(Debug, Clone)]
pub struct IndexNode {
    id: NodeId,
    role: NodeRole,
    pointers: RangeList,
    entries: RangeList,
}

impl IndexNode {
    pub fn new(id: NodeId, layout: NodeLayout) -> Self {
        Self {
            id,
            role: layout.role,
            pointers: RangeList::new(layout.pointer_capacity),
            entries: RangeList::new(layout.entry_capacity),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.id.address
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_leaf(&self) -> bool {
        self.role == NodeRole::Leaf
    }

    pub fn layout(&self) -> NodeLayout {
        NodeLayout {
            role: self.role,
            pointer_capacity: self.pointers.capacity(),
            entry_capacity: self.entries.capacity(),
        }
    }

    pub fn pointers(&self) -> &RangeList {
        &self.pointers
    }

    pub fn entries(&self) -> &RangeList {
        &self.entries
    }

    /// The list this node's role writes to.
    pub fn ranges(&self) -> &RangeList {
        match self.role {
            NodeRole::Leaf => &self.entries,
            NodeRole::Internal => &self.pointers,
        }
    }

    pub fn append_entry(&self, min_ts: i64, max_ts: i64, value: i64) -> Result<()> {
        if self.role != NodeRole::Leaf {
            return Err(Error::invalid_argument(format!(
                "node {} is internal and takes no entries",
                self.id
            )));
        }
        self.entries.append(TimeRange::new(min_ts, max_ts, value))
    }

    /// Appends an entry whose end is set later by [`close_entry`](Self::close_entry).
    pub fn append_open_entry(&self, min_ts: i64, value: i64) -> Result<()> {
        if self.role != NodeRole::Leaf {
            return Err(Error::invalid_argument(format!(
                "node {} is internal and takes no entries",
                self.id
            )));
        }
        self.entries.append_open(min_ts, value)
    }

    pub fn close_entry(&self, max_ts: i64) -> Result<TimeRange> {
        self.entries.close_last(max_ts)
    }

    pub fn has_open_entry(&self) -> bool {
        self.role == NodeRole::Leaf && self.entries.has_open()
    }

    pub fn append_pointer(&self, min_ts: i64, max_ts: i64, child_address: u64) -> Result<()> {
        if self.role != NodeRole::Internal {
            return Err(Error::invalid_argument(format!(
                "node {} is a leaf and takes no pointers",
                self.id
            )));
        }
        if child_address >= self.id.address {
            return Err(Error::invalid_argument(format!(
                "child {} must precede parent {} in post-order",
                child_address, self.id.address
            )));
        }
        let value = i64::try_from(child_address)
            .map_err(|_| Error::invalid_argument("child address does not fit in i64"))?;
        if let Some(last) = self.pointers.last() {
            if value <= last.value {
                return Err(Error::invalid_argument(format!(
                    "child {} must follow previous child {}",
                    value, last.value
                )));
            }
        }
        self.pointers.append(TimeRange::new(min_ts, max_ts, value))
    }

    /// `[first.min_ts, last.max_ts]` of the live list, valued with this
    /// node's address: the pointer range a parent stores for it.
    pub fn summary(&self) -> Option<TimeRange> {
        let ranges = self.ranges().snapshot();
        let first = ranges.first()?;
        let last = ranges.last()?;
        let address = i64::try_from(self.id.address).ok()?;
        Some(TimeRange::new(first.min_ts, last.max_ts, address))
    }

    /// True once the live list is full and its last entry closed; a sealed
    /// node never changes again.
    pub fn is_sealed(&self) -> bool {
        self.ranges().is_full() && !self.has_open_entry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(capacity: usize) -> IndexNode {
        IndexNode::new(
            NodeId::new(1, 1),
            NodeLayout {
                role: NodeRole::Leaf,
                pointer_capacity: 3,
                entry_capacity: capacity,
            },
        )
    }

    fn leaf_with(ranges: &[(i64, i64, i64)]) -> IndexNode {
        let node = leaf(16);
        for &(min, max, value) in ranges {
            node.append_entry(min, max, value).expect("append");
        }
        node
    }

    #[test]
    fn search_smoke() {
        let node = leaf_with(&[
            (1, 1, 1),
            (3, 3, 2),
            (5, 5, 3),
            (7, 7, 4),
            (9, 9, 5),
            (11, 11, 6),
            (13, 13, 7),
        ]);
        let entries = node.entries();
        assert_eq!(entries.find_first(5), Some(2));
        assert_eq!(entries.find_last(9), Some(4));
        assert_eq!(entries.find_all(11), Some(vec![6]));
        assert_eq!(entries.find_all_floor_based(11, 11), Some(vec![6, 5]));
    }

    #[test]
    fn overlapping_ranges() {
        let node = leaf_with(&[
            (1, 2, 1),
            (2, 4, 2),
            (4, 8, 3),
            (8, 12, 4),
            (8, 12, 5),
            (8, 12, 6),
            (15, 16, 7),
            (15, 16, 8),
        ]);
        let entries = node.entries();
        let value_at = |idx: Option<usize>| idx.and_then(|i| entries.get(i)).map(|r| r.value);
        assert_eq!(value_at(entries.find_first(4)), Some(2));
        assert_eq!(value_at(entries.find_last(8)), Some(6));
        assert_eq!(entries.find_all(8), Some(vec![3, 4, 5, 6]));
        assert_eq!(entries.find_all(2), Some(vec![1, 2]));
        assert_eq!(entries.find_all(15), Some(vec![7, 8]));
    }

    #[test]
    fn gap_between_ranges_is_not_found() {
        let node = leaf_with(&[(1, 2, 1), (4, 5, 2), (5, 6, 3), (7, 8, 4), (8, 9, 5)]);
        let entries = node.entries();
        assert_eq!(entries.find_first(3), None);
        assert_eq!(entries.find_last(3), None);
        assert_eq!(entries.find_all(3), None);
        assert_eq!(entries.find_all(0), None);
        assert_eq!(entries.find_all(10), None);
        assert_eq!(entries.find_all(5), Some(vec![2, 3]));
    }

    #[test]
    fn empty_node_finds_nothing() {
        let node = leaf(10);
        let entries = node.entries();
        assert_eq!(entries.find_first(4), None);
        assert_eq!(entries.find_last(4), None);
        assert_eq!(entries.find_all(4), None);
        assert_eq!(entries.find_all_floor_based(2, 2), None);
        assert_eq!(node.summary(), None);
    }

    #[test]
    fn duplicate_points_floor_based() {
        let node = leaf_with(&[
            (1, 1, 1),
            (2, 2, 2),
            (4, 4, 3),
            (12, 12, 4),
            (12, 12, 5),
            (12, 12, 6),
            (15, 15, 7),
        ]);
        let entries = node.entries();
        assert_eq!(entries.find_first_floor(12), Some(2));
        assert_eq!(entries.find_last_floor(12), Some(5));
        assert_eq!(entries.find_all_floor_based(12, 12), Some(vec![6, 5, 4, 3]));
    }

    #[test]
    fn floor_based_range_search() {
        let node = leaf_with(&[
            (5, 5, 1),
            (8, 8, 2),
            (15, 15, 3),
            (20, 20, 4),
            (25, 25, 5),
            (33, 33, 6),
            (40, 40, 7),
        ]);
        let e = node.entries();
        assert_eq!(e.find_all_floor_based(12, 20), Some(vec![4, 3, 2]));
        assert_eq!(e.find_all_floor_based(20, 32), Some(vec![5, 4, 3]));
        assert_eq!(e.find_all_floor_based(12, 32), Some(vec![5, 4, 3, 2]));
        assert_eq!(e.find_all_floor_based(4, 51), Some(vec![7, 6, 5, 4, 3, 2, 1]));
        assert_eq!(e.find_all_floor_based(12, 13), Some(vec![2]));
        assert_eq!(e.find_all_floor_based(12, 15), Some(vec![3, 2]));
        assert_eq!(e.find_all_floor_based(8, 12), Some(vec![2, 1]));
        assert_eq!(e.find_all_floor_based(1, 4), None);
        assert_eq!(e.find_all_floor_based(51, 55), Some(vec![7]));
        assert_eq!(e.find_all_floor_based(37, 55), Some(vec![7, 6]));
        assert_eq!(e.find_all_floor_based(15, 20), Some(vec![4, 3, 2]));
    }

    #[test]
    fn strict_range_search_over_ranges() {
        let node = leaf_with(&[
            (5, 7, 1),
            (9, 12, 2),
            (15, 17, 3),
            (20, 20, 4),
            (20, 20, 5),
            (20, 25, 6),
            (30, 40, 7),
        ]);
        let e = node.entries();
        assert_eq!(e.find_all_between(1, 3), None);
        assert_eq!(e.find_all_between(41, 44), None);
        assert_eq!(e.find_all_between(13, 14), None);
        assert_eq!(e.find_all_between(1, 8), Some(vec![1]));
        assert_eq!(e.find_all_between(35, 45), Some(vec![7]));
        assert_eq!(e.find_all_between(17, 20), Some(vec![6, 5, 4, 3]));
        assert_eq!(e.find_all_between(20, 20), Some(vec![6, 5, 4]));
    }

    #[test]
    fn append_rejects_out_of_order_and_inverted_ranges() {
        let node = leaf(4);
        node.append_entry(10, 20, 1).expect("append");
        assert!(matches!(
            node.append_entry(15, 12, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            node.append_entry(5, 25, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            node.append_entry(11, 19, 2),
            Err(Error::InvalidArgument(_))
        ));
        node.append_entry(10, 20, 2).expect("identical range is allowed");
        assert_eq!(node.entries().len(), 2);
    }

    #[test]
    fn append_fails_when_full() {
        let node = leaf(2);
        node.append_entry(1, 1, 1).expect("append");
        node.append_entry(2, 2, 2).expect("append");
        assert!(node.is_sealed());
        assert!(matches!(
            node.append_entry(3, 3, 3),
            Err(Error::CapacityExceeded { capacity: 2 })
        ));
        assert_eq!(node.entries().len(), 2);
    }

    #[test]
    fn roles_guard_their_lists() {
        let config = IndexConfig::new(3, 4);
        let parent = IndexNode::new(NodeId::new(1, 4), NodeLayout::internal(&config));
        assert!(matches!(
            parent.append_entry(1, 1, 1),
            Err(Error::InvalidArgument(_))
        ));
        parent.append_pointer(1, 3, 1).expect("pointer");
        parent.append_pointer(4, 6, 2).expect("pointer");
        assert!(matches!(
            parent.append_pointer(7, 9, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            parent.append_pointer(7, 9, 4),
            Err(Error::InvalidArgument(_))
        ));
        parent.append_pointer(7, 9, 3).expect("pointer");
        assert!(parent.is_sealed());
        assert_eq!(parent.summary(), Some(TimeRange::new(1, 9, 4)));

        let leaf = IndexNode::new(NodeId::new(1, 1), NodeLayout::leaf(&config));
        assert!(matches!(
            leaf.append_pointer(1, 1, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn snapshot_length_is_stable() {
        let node = leaf(8);
        node.append_entry(1, 1, 1).expect("append");
        let snapshot = node.entries().snapshot();
        assert_eq!(snapshot.len(), 1);
        drop(snapshot);
        node.append_entry(2, 2, 2).expect("append");
        assert_eq!(node.entries().snapshot().len(), 2);
    }

    #[test]
    fn floor_based_search_uses_start_times() {
        let node = leaf_with(&[(3, 5, 1), (8, 12, 2), (15, 18, 3), (18, 18, 4), (20, 23, 5)]);
        let e = node.entries();
        assert_eq!(e.find_all_floor_based(13, 14), Some(vec![2]));
        assert_eq!(e.find_all_between(13, 14), None);
        assert_eq!(e.find_all_floor_based(10, 16), Some(vec![3, 2]));
        assert_eq!(e.find_all_floor_based(1, 2), None);
    }

    #[test]
    fn open_entry_is_searchable_and_closed_once() {
        let node = leaf(2);
        node.append_entry(3, 5, 1).expect("append");
        node.append_open_entry(8, 2).expect("open");
        assert!(node.has_open_entry());
        assert!(!node.is_sealed(), "full but still open");
        assert_eq!(node.entries().find_all_between(100, 200), Some(vec![2]));
        assert_eq!(node.entries().find_all_floor_based(6, 7), Some(vec![1]));

        assert!(matches!(node.close_entry(7), Err(Error::InvalidArgument(_))));
        assert_eq!(node.close_entry(12).expect("close"), TimeRange::new(8, 12, 2));
        assert!(node.is_sealed());
        assert_eq!(node.entries().find_all_between(100, 200), None);
        assert!(matches!(node.close_entry(13), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn open_entry_blocks_further_appends() {
        let node = leaf(4);
        node.append_open_entry(10, 1).expect("open");
        assert!(matches!(
            node.append_entry(20, 20, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            node.append_open_entry(20, 2),
            Err(Error::InvalidArgument(_))
        ));
        node.close_entry(15).expect("close");
        node.append_entry(15, 20, 2).expect("append after close");
        assert_eq!(node.entries().len(), 2);
    }

    #[test]
    fn clone_does_not_share_ranges() {
        let node = leaf(4);
        node.append_entry(1, 1, 1).expect("append");
        let staged = node.clone();
        staged.append_entry(2, 2, 2).expect("append");
        assert_eq!(node.entries().len(), 1);
        assert_eq!(staged.entries().len(), 2);
    }
}
