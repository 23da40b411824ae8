//! Post-order heap time index.
//!
//! Entries are appended to leaves in time order. A leaf is complete once it
//! holds `entries_per_node` closed entries; every time `arity` complete
//! subtrees of the same height exist, a parent summarizing them is created at
//! the next address (a base-`arity` carry). Node addresses therefore list the
//! tree in post-order and a node's children follow from its address alone.
//!
//! The subtrees no parent references yet form the *forest*. Queries start
//! from a published snapshot of the forest roots and resolve nodes through the
//! [`NodeStore`] one at a time, releasing each before moving on.
//!
//! Every change to a node is first applied to a private copy and persisted;
//! only then does the shared node, and with it any reader, see it. A failed
//! write therefore leaves both the store and the tree as they were.
//!
//! # Concurrency
//!
//! One writer at a time (appends serialize on an internal mutex), any number
//! of concurrent readers. Readers only ever see persisted slots, never a
//! partially written one.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::config::IndexConfig;
use crate::core::floor_search;
use crate::core::heap;
use crate::core::node::{IndexNode, NodeId, NodeLayout, NodeRole};
use crate::core::node_store::{NodeGuard, NodeStore};
use crate::core::time_range::{TimeRange, OPEN_MAX_TS};
use crate::core::{Error, Result};

/// Root of a subtree that no parent references yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestRoot {
    pub address: u64,
    pub height: u32,
    pub min_ts: i64,
    /// Upper bound at publication time; the open leaf may have grown since.
    pub max_ts: i64,
}

#[derive(Debug)]
struct Published {
    /// Oldest first; the open leaf, if any, is last.
    roots: Vec<ForestRoot>,
    node_count: u64,
    entry_count: u64,
    last_ts: Option<i64>,
    entry_open: bool,
}

#[derive(Debug)]
struct WriterState {
    next_address: u64,
    /// Completed subtrees awaiting their siblings, per height, oldest first.
    levels: Vec<Vec<ForestRoot>>,
    open_leaf: Option<ForestRoot>,
    open_leaf_entries: usize,
    entry_count: u64,
    /// End of the last entry, or its start while it is open.
    last_ts: Option<i64>,
    entry_open: bool,
}

impl WriterState {
    fn new() -> Self {
        Self {
            next_address: 1,
            levels: Vec::new(),
            open_leaf: None,
            open_leaf_entries: 0,
            entry_count: 0,
            last_ts: None,
            entry_open: false,
        }
    }

    fn push_completed(&mut self, root: ForestRoot) {
        let height = root.height as usize;
        if self.levels.len() <= height {
            self.levels.resize_with(height + 1, Vec::new);
        }
        self.levels[height].push(root);
    }

    /// Parents created if one more subtree of height 0 completes.
    fn carry_depth(&self, arity: usize) -> u64 {
        self.levels
            .iter()
            .take_while(|level| level.len() + 1 == arity)
            .count() as u64
    }

    /// Records the open leaf after a successful write to it.
    fn leaf_written(&mut self, leaf: &IndexNode, root: ForestRoot) {
        if leaf.is_sealed() {
            self.open_leaf = None;
            self.open_leaf_entries = 0;
            self.push_completed(root);
        } else {
            self.open_leaf = Some(root);
            self.open_leaf_entries = leaf.entries().len();
        }
    }

    fn publish(&self) -> Published {
        let mut roots: Vec<ForestRoot> = self.levels.iter().flatten().copied().collect();
        roots.extend(self.open_leaf);
        roots.sort_unstable_by_key(|root| root.address);
        Published {
            roots,
            node_count: self.next_address - 1,
            entry_count: self.entry_count,
            last_ts: self.last_ts,
            entry_open: self.entry_open,
        }
    }
}

pub struct PostOrderTree<S: NodeStore> {
    owner_id: u64,
    config: IndexConfig,
    store: S,
    writer: Mutex<WriterState>,
    published: RwLock<Arc<Published>>,
}

impl<S: NodeStore> PostOrderTree<S> {
    /// Creates an empty index for `owner_id`.
    ///
    /// # Errors
    ///
    /// - `Error::Config`: invalid `config`
    /// - `Error::InvalidArgument`: the store already holds nodes for
    ///   `owner_id` (use [`open`](Self::open))
    pub fn new(owner_id: u64, config: IndexConfig, store: S) -> Result<Self> {
        config.validate()?;
        let existing = store.last_address(owner_id)?;
        if existing != 0 {
            return Err(Error::invalid_argument(format!(
                "owner {owner_id} already has {existing} persisted nodes"
            )));
        }
        Ok(Self::with_state(owner_id, config, store, WriterState::new()))
    }

    /// Reopens the index for `owner_id` from whatever the store persisted.
    ///
    /// A store with no nodes for `owner_id` yields an empty index. Parents
    /// whose creation was interrupted are created before this returns.
    pub fn open(owner_id: u64, config: IndexConfig, store: S) -> Result<Self> {
        config.validate()?;
        let last_address = store.last_address(owner_id)?;
        let tree = Self::with_state(owner_id, config, store, WriterState::new());
        if last_address == 0 {
            return Ok(tree);
        }
        {
            let mut state = tree.writer.lock();
            let recovered = tree
                .recover(&mut state, last_address)
                .and_then(|()| tree.settle(&mut state));
            tree.publish(&state);
            recovered?;
            log::info!(
                "recovered index {owner_id}: {} nodes, {} entries, {} roots",
                state.next_address - 1,
                state.entry_count,
                state.levels.iter().map(Vec::len).sum::<usize>()
                    + usize::from(state.open_leaf.is_some())
            );
        }
        Ok(tree)
    }

    fn with_state(owner_id: u64, config: IndexConfig, store: S, state: WriterState) -> Self {
        let published = Arc::new(state.publish());
        Self {
            owner_id,
            config,
            store,
            writer: Mutex::new(state),
            published: RwLock::new(published),
        }
    }

    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Nodes created so far (the highest assigned address).
    pub fn node_count(&self) -> u64 {
        self.snapshot().node_count
    }

    pub fn entry_count(&self) -> u64 {
        self.snapshot().entry_count
    }

    /// Upper bound of the last appended entry, or its start while the entry
    /// is still open.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.snapshot().last_ts
    }

    /// True between [`append_min`](Self::append_min) and
    /// [`set_max`](Self::set_max).
    pub fn has_open_entry(&self) -> bool {
        self.snapshot().entry_open
    }

    /// Current forest roots, oldest first.
    pub fn roots(&self) -> Vec<ForestRoot> {
        self.snapshot().roots.clone()
    }

    fn snapshot(&self) -> Arc<Published> {
        Arc::clone(&self.published.read())
    }

    fn publish(&self, state: &WriterState) {
        *self.published.write() = Arc::new(state.publish());
    }

    // ------------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------------

    /// Appends a point entry.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: `ts` precedes the last appended timestamp,
    ///   or the last entry is still open
    /// - `Error::IndexFull`: no node address left for the new leaf or parents
    /// - storage failures from the node store; the entry is then not added
    pub fn append(&self, ts: i64, value: i64) -> Result<()> {
        self.append_range(ts, ts, value)
    }

    /// Appends an entry covering `[min_ts, max_ts]`, e.g. the first and last
    /// record time of a data segment. `min_ts` must not precede the upper
    /// bound of the previous entry.
    pub fn append_range(&self, min_ts: i64, max_ts: i64, value: i64) -> Result<()> {
        let mut state = self.writer.lock();
        let result = self.append_locked(&mut state, min_ts, Some(max_ts), value);
        self.publish(&state);
        result
    }

    /// Opens an entry whose end is not known yet, e.g. a segment that is
    /// still being written. Until [`set_max`](Self::set_max) it matches every
    /// timestamp from `min_ts` on, and no other entry can be appended.
    pub fn append_min(&self, min_ts: i64, value: i64) -> Result<()> {
        let mut state = self.writer.lock();
        let result = self.append_locked(&mut state, min_ts, None, value);
        self.publish(&state);
        result
    }

    /// Closes the open entry at `max_ts`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: no entry is open, or `max_ts` precedes its
    ///   start
    /// - `Error::IndexFull`: closing completes a leaf whose parents have no
    ///   address left
    pub fn set_max(&self, max_ts: i64) -> Result<()> {
        let mut state = self.writer.lock();
        let result = self.close_locked(&mut state, max_ts);
        self.publish(&state);
        result
    }

    fn append_locked(
        &self,
        state: &mut WriterState,
        min_ts: i64,
        max_ts: Option<i64>,
        value: i64,
    ) -> Result<()> {
        if state.entry_open {
            return Err(Error::invalid_argument(
                "last entry is still open; set its end first",
            ));
        }
        if let Some(max_ts) = max_ts {
            if min_ts > max_ts {
                return Err(Error::invalid_argument(format!(
                    "entry min {min_ts} is greater than max {max_ts}"
                )));
            }
        }
        if let Some(last) = state.last_ts {
            if min_ts < last {
                return Err(Error::invalid_argument(format!(
                    "timestamp {min_ts} precedes last appended timestamp {last}"
                )));
            }
        }
        self.settle(state)?;

        let arity = self.config.arity;
        let epn = self.config.entries_per_node;
        let opens_leaf = state.open_leaf.is_none();
        let mut needed = u64::from(opens_leaf);
        if max_ts.is_some() && state.open_leaf_entries + 1 >= epn {
            needed += state.carry_depth(arity);
        }
        self.reserve(state.next_address, needed)?;

        let leaf_address = state
            .open_leaf
            .map_or(state.next_address, |leaf| leaf.address);
        let leaf = NodeGuard::acquire(
            &self.store,
            self.node_id(leaf_address),
            NodeLayout::leaf(&self.config),
        )?;
        if opens_leaf && !leaf.entries().is_empty() {
            return Err(Error::Corrupt("new leaf node already holds entries"));
        }
        self.commit(&leaf, |node| match max_ts {
            Some(max_ts) => node.append_entry(min_ts, max_ts, value),
            None => node.append_open_entry(min_ts, value),
        })?;

        if opens_leaf {
            state.next_address += 1;
            log::debug!("created leaf node {}", leaf.id());
        }
        state.entry_count += 1;
        state.last_ts = Some(max_ts.unwrap_or(min_ts));
        state.entry_open = max_ts.is_none();
        let root = ForestRoot {
            address: leaf_address,
            height: 0,
            min_ts: state.open_leaf.map_or(min_ts, |open| open.min_ts),
            max_ts: max_ts.unwrap_or(OPEN_MAX_TS),
        };
        state.leaf_written(&leaf, root);

        leaf.release()?;
        self.settle(state)
    }

    fn close_locked(&self, state: &mut WriterState, max_ts: i64) -> Result<()> {
        if !state.entry_open {
            return Err(Error::invalid_argument("no open entry to close"));
        }
        let Some(open_leaf) = state.open_leaf else {
            return Err(Error::Corrupt("open entry without an open leaf"));
        };
        if let Some(start) = state.last_ts {
            if max_ts < start {
                return Err(Error::invalid_argument(format!(
                    "end {max_ts} precedes the open entry's start {start}"
                )));
            }
        }
        self.settle(state)?;

        let needed = if state.open_leaf_entries >= self.config.entries_per_node {
            state.carry_depth(self.config.arity)
        } else {
            0
        };
        self.reserve(state.next_address, needed)?;

        let leaf = self.acquire_node(open_leaf.address, 0)?;
        self.commit(&leaf, |node| node.close_entry(max_ts).map(|_| ()))?;

        state.last_ts = Some(max_ts);
        state.entry_open = false;
        let root = ForestRoot { max_ts, ..open_leaf };
        state.leaf_written(&leaf, root);
        log::debug!("closed last entry of node {} at {max_ts}", leaf.id());

        leaf.release()?;
        self.settle(state)
    }

    /// Persists `node` as `change` leaves it, then applies `change` to the
    /// shared node. Nothing is visible if validation or the write fails.
    fn commit<F>(&self, node: &IndexNode, change: F) -> Result<()>
    where
        F: Fn(&IndexNode) -> Result<()>,
    {
        let staged = node.clone();
        change(&staged)?;
        self.store.persist(&staged)?;
        change(node)
    }

    fn reserve(&self, next_address: u64, needed: u64) -> Result<()> {
        if needed == 0 {
            return Ok(());
        }
        let limit = self.config.address_limit();
        match next_address.checked_add(needed - 1) {
            Some(last) if last <= limit => Ok(()),
            _ => Err(Error::IndexFull { limit }),
        }
    }

    /// Creates parents for every height holding `arity` completed subtrees.
    fn settle(&self, state: &mut WriterState) -> Result<()> {
        let mut height = 0;
        while height < state.levels.len() {
            while state.levels[height].len() >= self.config.arity {
                self.merge(state, height)?;
            }
            height += 1;
        }
        Ok(())
    }

    fn merge(&self, state: &mut WriterState, height: usize) -> Result<()> {
        let arity = self.config.arity;
        let address = state.next_address;
        self.reserve(address, 1)?;

        let children: Vec<ForestRoot> = state.levels[height][..arity].to_vec();
        let parent = NodeGuard::acquire(
            &self.store,
            self.node_id(address),
            NodeLayout::internal(&self.config),
        )?;
        if !parent.pointers().is_empty() {
            return Err(Error::Corrupt("new parent node already holds pointers"));
        }
        self.commit(&parent, |node| {
            for child in &children {
                node.append_pointer(child.min_ts, child.max_ts, child.address)?;
            }
            Ok(())
        })?;

        let merged = ForestRoot {
            address,
            height: height as u32 + 1,
            min_ts: children[0].min_ts,
            max_ts: children[arity - 1].max_ts,
        };
        state.next_address += 1;
        state.levels[height].drain(..arity);
        state.push_completed(merged);
        log::debug!(
            "merged {arity} subtrees at height {height} into node {}",
            parent.id()
        );

        parent.release()
    }

    /// Rebuilds writer state from the persisted address prefix `1..=last_address`.
    fn recover(&self, state: &mut WriterState, last_address: u64) -> Result<()> {
        let arity = self.config.arity;
        let epn = self.config.entries_per_node as u64;
        let subtrees = heap::decompose(last_address, arity);
        let mut entry_count: u64 = 0;

        for (i, subtree) in subtrees.iter().enumerate() {
            let node = self.acquire_node(subtree.root, subtree.height)?;
            if node.layout() != NodeLayout::with_role(node.role(), &self.config) {
                return Err(Error::Config(format!(
                    "node {} was written with a different index shape",
                    node.id()
                )));
            }
            let summary = node
                .summary()
                .ok_or(Error::Corrupt("referenced node is empty"))?;
            let root = ForestRoot {
                address: subtree.root,
                height: subtree.height,
                min_ts: summary.min_ts,
                max_ts: summary.max_ts,
            };
            let last = i + 1 == subtrees.len();
            state.last_ts = Some(summary.max_ts);
            if subtree.height == 0 && !node.is_sealed() {
                if !last {
                    return Err(Error::Corrupt("unsealed leaf before the end of the index"));
                }
                let len = node.entries().len();
                entry_count += len as u64;
                state.open_leaf = Some(root);
                state.open_leaf_entries = len;
                if node.has_open_entry() {
                    state.entry_open = true;
                    state.last_ts = node.entries().last().map(|entry| entry.min_ts);
                }
            } else {
                let leaves = (arity as u64).saturating_pow(subtree.height);
                entry_count = entry_count.saturating_add(leaves.saturating_mul(epn));
                state.push_completed(root);
            }
            node.release()?;
        }

        state.next_address = last_address + 1;
        state.entry_count = entry_count;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Value of the last entry starting at or before `ts`, or `None` if `ts`
    /// precedes every entry.
    pub fn find_highest(&self, ts: i64) -> Result<Option<i64>> {
        let snapshot = self.snapshot();
        let Some(root) = snapshot.roots.iter().rev().find(|root| root.min_ts <= ts) else {
            return Ok(None);
        };

        let mut address = root.address;
        let mut height = root.height;
        loop {
            let node = self.acquire_node(address, height)?;
            // the last range containing ts is also the last one starting
            // at or before it
            let picked = {
                let ranges = node.ranges().snapshot();
                floor_search::find_last_floor(&ranges, ts).map(|idx| ranges[idx])
            };
            node.release()?;
            let Some(picked) = picked else {
                return Ok(None);
            };
            if height == 0 {
                return Ok(Some(picked.value));
            }
            log::trace!("find_highest({ts}): node {address} -> {}", picked.value);
            address = child_address(address, picked.value)?;
            height -= 1;
        }
    }

    /// Values of the entries intersecting `[min_ts, max_ts]`, grouped per
    /// leaf. An open entry intersects everything from its start on.
    ///
    /// Groups are ordered newest leaf first and values newest first within a
    /// group. Returns `None` if no entry falls in the interval.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: `min_ts > max_ts`
    pub fn find_all(&self, min_ts: i64, max_ts: i64) -> Result<Option<Vec<Vec<i64>>>> {
        check_interval(min_ts, max_ts)?;
        let snapshot = self.snapshot();
        let roots = &snapshot.roots;

        let mut groups = Vec::new();
        for (i, root) in roots.iter().enumerate().rev() {
            let may_have_grown = i + 1 == roots.len() && root.height == 0;
            if root.min_ts > max_ts {
                continue;
            }
            if root.max_ts < min_ts && !may_have_grown {
                break;
            }
            self.collect(root.address, root.height, min_ts, max_ts, Search::Overlap, &mut groups)?;
        }
        Ok((!groups.is_empty()).then_some(groups))
    }

    /// Like [`find_all`](Self::find_all), but judged by start times only:
    /// the entries starting in `[min_ts, max_ts]` plus the last entry
    /// starting before `min_ts`, whose records may reach into the interval
    /// whatever its recorded end.
    ///
    /// Returns `None` only if no entry starts at or before `max_ts`.
    pub fn find_all_min_based(&self, min_ts: i64, max_ts: i64) -> Result<Option<Vec<Vec<i64>>>> {
        check_interval(min_ts, max_ts)?;
        let snapshot = self.snapshot();
        let roots = &snapshot.roots;
        let Some(span) = floor_search::find_floor_span(&root_ranges(roots), min_ts, max_ts) else {
            return Ok(None);
        };

        let mut groups = Vec::new();
        for root in roots[span].iter().rev() {
            self.collect(root.address, root.height, min_ts, max_ts, Search::MinBased, &mut groups)?;
        }
        Ok((!groups.is_empty()).then_some(groups))
    }

    /// Appends one group per matching leaf under `address`, newest first.
    fn collect(
        &self,
        address: u64,
        height: u32,
        min_ts: i64,
        max_ts: i64,
        search: Search,
        groups: &mut Vec<Vec<i64>>,
    ) -> Result<()> {
        let node = self.acquire_node(address, height)?;
        let found = match search {
            Search::Overlap => node.ranges().find_all_between(min_ts, max_ts),
            Search::MinBased => node.ranges().find_all_floor_based(min_ts, max_ts),
        };
        node.release()?;
        let Some(found) = found else {
            return Ok(());
        };
        if height == 0 {
            groups.push(found);
            return Ok(());
        }
        log::trace!("{search:?} search: node {address} matches {} children", found.len());
        for child in found {
            let child = child_address(address, child)?;
            self.collect(child, height - 1, min_ts, max_ts, search, groups)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------------

    fn node_id(&self, address: u64) -> NodeId {
        NodeId::new(self.owner_id, address)
    }

    /// Acquires a node that some root or pointer refers to.
    fn acquire_node(&self, address: u64, height: u32) -> Result<NodeGuard<'_, S>> {
        let role = if height == 0 {
            NodeRole::Leaf
        } else {
            NodeRole::Internal
        };
        let node = NodeGuard::acquire(
            &self.store,
            self.node_id(address),
            NodeLayout::with_role(role, &self.config),
        )?;
        if node.role() != role {
            return Err(Error::Corrupt("node role does not match its height"));
        }
        if node.ranges().is_empty() {
            return Err(Error::Corrupt("referenced node is empty"));
        }
        Ok(node)
    }
}

#[derive(Debug, Clone, Copy)]
enum Search {
    /// Ranges intersecting the interval.
    Overlap,
    /// Ranges starting in the interval plus the last one starting before it.
    MinBased,
}

fn check_interval(min_ts: i64, max_ts: i64) -> Result<()> {
    if min_ts > max_ts {
        return Err(Error::invalid_argument(format!(
            "range min {min_ts} is greater than max {max_ts}"
        )));
    }
    Ok(())
}

fn root_ranges(roots: &[ForestRoot]) -> Vec<TimeRange> {
    roots
        .iter()
        .map(|root| TimeRange::new(root.min_ts, root.max_ts, root.address as i64))
        .collect()
}

fn child_address(parent: u64, value: i64) -> Result<u64> {
    u64::try_from(value)
        .ok()
        .filter(|&child| child > 0 && child < parent)
        .ok_or(Error::Corrupt("child pointer out of range"))
}
