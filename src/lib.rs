//! Post-order heap (POH) time index.
//!
//! Maps application timestamps to append positions for append-only stores.
//! The tree is built incrementally by carry propagation, never rebalanced,
//! and addresses its nodes by post-order position instead of stored links.

pub mod core;

pub use crate::core::{
    Error, FileNodeStore, ForestRoot, IndexConfig, IndexNode, MemoryNodeStore, NodeGuard, NodeId,
    NodeStore, PostOrderTree, Result, StoreConfig, TimeRange,
};
