//! Node store capability consumed by the tree.
//!
//! The tree never holds node references across operations; it resolves
//! `(owner_id, address)` through a [`NodeStore`] every time and hands the
//! node back when done. [`NodeGuard`] scopes that pairing so every successful
//! `acquire` is matched by exactly one `release`, including on error paths.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::codec::{decode_node, encode_node};
use crate::core::node::{IndexNode, NodeId, NodeLayout};
use crate::core::{Error, Result};

pub trait NodeStore: Send + Sync {
    /// Loads the node, or creates an empty one shaped by `layout` if it was
    /// never persisted.
    fn acquire(&self, id: NodeId, layout: NodeLayout) -> Result<Arc<IndexNode>>;

    /// Ends one acquisition of `id`.
    fn release(&self, id: NodeId) -> Result<()>;

    /// Makes the node's current contents durable.
    fn persist(&self, node: &IndexNode) -> Result<()>;

    /// Highest persisted address for `owner_id`, or 0 if the owner has none.
    fn last_address(&self, owner_id: u64) -> Result<u64>;
}

impl<S: NodeStore + ?Sized> NodeStore for Arc<S> {
    fn acquire(&self, id: NodeId, layout: NodeLayout) -> Result<Arc<IndexNode>> {
        (**self).acquire(id, layout)
    }

    fn release(&self, id: NodeId) -> Result<()> {
        (**self).release(id)
    }

    fn persist(&self, node: &IndexNode) -> Result<()> {
        (**self).persist(node)
    }

    fn last_address(&self, owner_id: u64) -> Result<u64> {
        (**self).last_address(owner_id)
    }
}

/// An acquired node that is released when the guard goes away.
///
/// Call [`release`](Self::release) on the success path to observe release
/// failures; a guard dropped without it (early return, `?`) still releases
/// and only logs a failure.
pub struct NodeGuard<'a, S: NodeStore + ?Sized> {
    store: &'a S,
    node: Arc<IndexNode>,
    released: bool,
}

impl<'a, S: NodeStore + ?Sized> NodeGuard<'a, S> {
    pub fn acquire(store: &'a S, id: NodeId, layout: NodeLayout) -> Result<Self> {
        let node = store.acquire(id, layout)?;
        Ok(Self {
            store,
            node,
            released: false,
        })
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release(self.node.id())
    }
}

impl<S: NodeStore + ?Sized> Deref for NodeGuard<'_, S> {
    type Target = IndexNode;

    fn deref(&self) -> &IndexNode {
        &self.node
    }
}

impl<S: NodeStore + ?Sized> Drop for NodeGuard<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.store.release(self.node.id()) {
            log::warn!("failed to release index node {}: {err}", self.node.id());
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    live: HashMap<NodeId, Arc<IndexNode>>,
    persisted: HashMap<NodeId, Vec<u8>>,
    outstanding: HashMap<NodeId, usize>,
}

/// In-process node store.
///
/// Persisting encodes the node, so dropping the live copies with
/// [`evict_live`](Self::evict_live) forces later acquisitions through the
/// persisted form.
#[derive(Default)]
pub struct MemoryNodeStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquisitions not yet released, across all nodes.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.values().sum()
    }

    /// Decodes the persisted form of `id`, if any.
    pub fn load_persisted(&self, id: NodeId) -> Result<Option<IndexNode>> {
        let inner = self.inner.lock();
        inner
            .persisted
            .get(&id)
            .map(|buf| decode_node(buf, Some(id)))
            .transpose()
    }

    /// Drops in-memory copies that nobody holds.
    pub fn evict_live(&self) {
        let mut inner = self.inner.lock();
        let MemoryInner {
            live, outstanding, ..
        } = &mut *inner;
        live.retain(|id, _| outstanding.get(id).copied().unwrap_or(0) > 0);
    }
}

impl NodeStore for MemoryNodeStore {
    fn acquire(&self, id: NodeId, layout: NodeLayout) -> Result<Arc<IndexNode>> {
        let mut inner = self.inner.lock();
        let node = match inner.live.get(&id) {
            Some(node) => Arc::clone(node),
            None => {
                let node = match inner.persisted.get(&id) {
                    Some(buf) => decode_node(buf, Some(id))?,
                    None => IndexNode::new(id, layout),
                };
                if node.role() != layout.role {
                    return Err(Error::Corrupt("node role mismatch"));
                }
                let node = Arc::new(node);
                inner.live.insert(id, Arc::clone(&node));
                node
            }
        };
        *inner.outstanding.entry(id).or_insert(0) += 1;
        Ok(node)
    }

    fn release(&self, id: NodeId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.outstanding.get_mut(&id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    inner.outstanding.remove(&id);
                }
                Ok(())
            }
            _ => Err(Error::storage(format!("release of {id} without acquire"))),
        }
    }

    fn persist(&self, node: &IndexNode) -> Result<()> {
        let buf = encode_node(node)?;
        self.inner.lock().persisted.insert(node.id(), buf);
        Ok(())
    }

    fn last_address(&self, owner_id: u64) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .persisted
            .keys()
            .filter(|id| id.owner_id == owner_id)
            .map(|id| id.address)
            .max()
            .unwrap_or(0))
    }
}
