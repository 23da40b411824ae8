//! Index and node store configuration.
//!
//! Both configs are plain serde structs so they can be shipped as JSON next
//! to the data they describe.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::codec::{NODE_HEADER_SIZE, NODE_TRAILER_SIZE, RANGE_SIZE};
use crate::core::{Error, Result};

/// Shape of one post-order heap index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of sibling subtrees merged into one parent (pointer slots per
    /// internal node).
    /// Default: 3
    pub arity: usize,

    /// Entry slots per leaf node.
    /// Default: 200
    pub entries_per_node: usize,

    /// Upper bound on node addresses; `None` leaves only the `i64` bound.
    /// Default: None
    #[serde(default)]
    pub max_nodes: Option<u64>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            arity: 3,
            entries_per_node: 200,
            max_nodes: None,
        }
    }
}

impl IndexConfig {
    pub fn new(arity: usize, entries_per_node: usize) -> Self {
        Self {
            arity,
            entries_per_node,
            max_nodes: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.arity < 2 {
            return Err(Error::Config(format!(
                "arity must be at least 2, got {}",
                self.arity
            )));
        }
        if self.entries_per_node == 0 {
            return Err(Error::Config("entries_per_node must be at least 1".into()));
        }
        if u32::try_from(self.arity.max(self.entries_per_node)).is_err() {
            return Err(Error::Config("node capacity does not fit in u32".into()));
        }
        if self.max_nodes == Some(0) {
            return Err(Error::Config("max_nodes must be at least 1".into()));
        }
        Ok(())
    }

    /// Persisted size of one node slot. Leaves and internal nodes share the
    /// same slot size so a node's byte offset is a pure function of its address.
    pub fn node_size_bytes(&self) -> usize {
        NODE_HEADER_SIZE + self.arity.max(self.entries_per_node) * RANGE_SIZE + NODE_TRAILER_SIZE
    }

    /// Highest assignable node address. Pointer ranges store child addresses
    /// as `i64`, so the limit never exceeds `i64::MAX`.
    pub fn address_limit(&self) -> u64 {
        self.max_nodes.unwrap_or(u64::MAX).min(i64::MAX as u64)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }
}

/// Layout of a [`FileNodeStore`](crate::core::FileNodeStore) directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Node slots per block file.
    /// Default: 1000
    pub nodes_per_block: u64,

    /// Owners grouped under one sub-directory.
    /// Default: 1000
    pub owners_per_dir: u64,

    /// Released nodes kept in memory before sealed ones are evicted.
    /// Default: 4096
    pub cache_nodes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            nodes_per_block: 1000,
            owners_per_dir: 1000,
            cache_nodes: 4096,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nodes_per_block == 0 {
            return Err(Error::Config("nodes_per_block must be at least 1".into()));
        }
        if self.owners_per_dir == 0 {
            return Err(Error::Config("owners_per_dir must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_config_default() {
        let config = IndexConfig::default();
        assert_eq!(config.arity, 3);
        assert_eq!(config.entries_per_node, 200);
        assert_eq!(config.max_nodes, None);
        config.validate().expect("default is valid");
    }

    #[test]
    fn test_index_config_rejects_degenerate_shapes() {
        assert!(matches!(IndexConfig::new(1, 10).validate(), Err(Error::Config(_))));
        assert!(matches!(IndexConfig::new(3, 0).validate(), Err(Error::Config(_))));
        let config = IndexConfig {
            max_nodes: Some(0),
            ..IndexConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_node_size_covers_largest_list() {
        let narrow = IndexConfig::new(3, 1);
        assert_eq!(
            narrow.node_size_bytes(),
            NODE_HEADER_SIZE + 3 * RANGE_SIZE + NODE_TRAILER_SIZE
        );
        let wide = IndexConfig::new(3, 200);
        assert_eq!(
            wide.node_size_bytes(),
            NODE_HEADER_SIZE + 200 * RANGE_SIZE + NODE_TRAILER_SIZE
        );
    }

    #[test]
    fn test_index_config_serialization() {
        let config = IndexConfig {
            arity: 4,
            entries_per_node: 16,
            max_nodes: Some(1 << 20),
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: IndexConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_max_nodes_is_optional_in_json() {
        let config: IndexConfig =
            serde_json::from_str(r#"{"arity":2,"entries_per_node":8}"#).unwrap();
        assert_eq!(config.max_nodes, None);
        assert_eq!(config.address_limit(), i64::MAX as u64);
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, r#"{"arity":1,"entries_per_node":8}"#).unwrap();
        assert!(matches!(IndexConfig::from_json_file(&path), Err(Error::Config(_))));

        std::fs::write(&path, r#"{"nodes_per_block":64,"owners_per_dir":10,"cache_nodes":8}"#)
            .unwrap();
        let store = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(store.nodes_per_block, 64);
        assert_eq!(store.cache_nodes, 8);
    }
}
