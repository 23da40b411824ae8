//! Post-order heap time index.
//!
//! Leaves first: [`TimeRange`] values, the floor searches over sorted ranges,
//! fixed-capacity [`IndexNode`]s and their persisted form, the node stores
//! that hold them, and the [`PostOrderTree`] that ties them together.

pub mod codec;
pub mod config;
pub mod error;
pub mod file_store;
pub mod floor_search;
pub mod heap;
pub mod node;
pub mod node_store;
pub mod time_range;
pub mod tree;

pub use config::{IndexConfig, StoreConfig};
pub use error::{Error, Result};
pub use file_store::FileNodeStore;
pub use heap::{child_addresses, decompose, height_of_node, height_of_root, total_nodes, Subtree};
pub use node::{IndexNode, NodeId, NodeLayout, NodeRole, RangeList};
pub use node_store::{MemoryNodeStore, NodeGuard, NodeStore};
pub use time_range::{TimeRange, OPEN_MAX_TS};
pub use tree::{ForestRoot, PostOrderTree};
