//! Block-file node persistence.
//!
//! Nodes of one owner are packed `nodes_per_block` to a file:
//!
//! ```text
//! <root>/<owner_id / owners_per_dir>/<owner_id>-<block:09>.poh
//! ```
//!
//! Every slot has the same size ([`IndexConfig::node_size_bytes`]), so a
//! node's byte offset is `(address % nodes_per_block) * node_size`. A slot
//! that was never written reads back as zeros.
//!
//! Acquired nodes are shared through a reference-counted cache. Released
//! sealed nodes are evicted lowest-address first once the cache grows past
//! `cache_nodes`; nodes that can still receive appends stay resident.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::codec::{decode_node, encode_node, is_empty_slot};
use crate::core::config::{IndexConfig, StoreConfig};
use crate::core::node::{IndexNode, NodeId, NodeLayout};
use crate::core::node_store::NodeStore;
use crate::core::{Error, Result};

const BLOCK_EXTENSION: &str = ".poh";

// ============================================================================
// Block Naming
// ============================================================================

/// Block filename for an owner (e.g., "42-000000003.poh").
pub fn block_filename(owner_id: u64, block: u64) -> String {
    format!("{owner_id}-{block:09}{BLOCK_EXTENSION}")
}

/// Parses a block filename, returning the block number if it belongs to
/// `owner_id`.
pub fn parse_block_filename(name: &str, owner_id: u64) -> Option<u64> {
    let base = name.strip_suffix(BLOCK_EXTENSION)?;
    let (owner, block) = base.split_once('-')?;
    if owner.parse::<u64>().ok()? != owner_id {
        return None;
    }
    if block.len() != 9 || !block.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    block.parse::<u64>().ok()
}

/// Sorted block numbers present for `owner_id` in `dir`.
fn discover_blocks(dir: &Path, owner_id: u64) -> Result<Vec<u64>> {
    let mut blocks = Vec::new();
    if !dir.exists() {
        return Ok(blocks);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(block) = parse_block_filename(name, owner_id) {
            blocks.push(block);
        }
    }
    blocks.sort_unstable();
    Ok(blocks)
}

// ============================================================================
// Store
// ============================================================================

struct CachedNode {
    node: Arc<IndexNode>,
    refs: usize,
}

pub struct FileNodeStore {
    root: PathBuf,
    config: IndexConfig,
    store_config: StoreConfig,
    node_size: usize,
    cache: Mutex<BTreeMap<NodeId, CachedNode>>,
    /// Bumped after every completed slot write; a load that raced one is
    /// discarded.
    writes: AtomicU64,
}

impl FileNodeStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(
        root: impl AsRef<Path>,
        config: IndexConfig,
        store_config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        store_config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            node_size: config.node_size_bytes(),
            config,
            store_config,
            cache: Mutex::new(BTreeMap::new()),
            writes: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Nodes currently held in memory.
    pub fn cached_nodes(&self) -> usize {
        self.cache.lock().len()
    }

    /// Acquisitions not yet released.
    pub fn outstanding(&self) -> usize {
        self.cache.lock().values().map(|c| c.refs).sum()
    }

    fn owner_dir(&self, owner_id: u64) -> PathBuf {
        let group = owner_id / self.store_config.owners_per_dir;
        self.root.join(group.to_string())
    }

    fn block_path(&self, owner_id: u64, block: u64) -> PathBuf {
        self.owner_dir(owner_id).join(block_filename(owner_id, block))
    }

    fn slot_offset(&self, address: u64) -> u64 {
        (address % self.store_config.nodes_per_block) * self.node_size as u64
    }

    fn open_block(&self, owner_id: u64, block: u64) -> Result<Option<File>> {
        match File::open(self.block_path(owner_id, block)) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads one slot; bytes past the end of the file read as zeros.
    fn read_slot(&self, id: NodeId) -> Result<Vec<u8>> {
        let block = id.address / self.store_config.nodes_per_block;
        match self.open_block(id.owner_id, block)? {
            Some(mut file) => {
                let len = file.metadata()?.len();
                self.read_slot_from(&mut file, len, id.address)
            }
            None => Ok(vec![0u8; self.node_size]),
        }
    }

    fn read_slot_from(&self, file: &mut File, len: u64, address: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.node_size];
        let offset = self.slot_offset(address);
        if offset >= len {
            return Ok(buf);
        }
        let available = (len - offset).min(self.node_size as u64) as usize;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..available])?;
        Ok(buf)
    }

    fn load(&self, id: NodeId, layout: NodeLayout) -> Result<IndexNode> {
        let slot = self.read_slot(id)?;
        let node = if is_empty_slot(&slot) {
            IndexNode::new(id, layout)
        } else {
            decode_node(&slot, Some(id))?
        };
        if node.role() != layout.role {
            return Err(Error::Corrupt("node role mismatch"));
        }
        Ok(node)
    }

    fn evict(&self, cache: &mut BTreeMap<NodeId, CachedNode>) {
        let limit = self.store_config.cache_nodes;
        if cache.len() <= limit {
            return;
        }
        let excess = cache.len() - limit;
        let victims: Vec<NodeId> = cache
            .iter()
            .filter(|(_, cached)| cached.refs == 0 && cached.node.is_sealed())
            .map(|(id, _)| *id)
            .take(excess)
            .collect();
        for id in victims {
            cache.remove(&id);
        }
    }
}

impl NodeStore for FileNodeStore {
    fn acquire(&self, id: NodeId, layout: NodeLayout) -> Result<Arc<IndexNode>> {
        loop {
            let seen = {
                let mut cache = self.cache.lock();
                if let Some(cached) = cache.get_mut(&id) {
                    cached.refs += 1;
                    return Ok(Arc::clone(&cached.node));
                }
                self.writes.load(Ordering::Acquire)
            };

            // disk reads happen without the cache lock
            let node = Arc::new(self.load(id, layout)?);

            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get_mut(&id) {
                cached.refs += 1;
                return Ok(Arc::clone(&cached.node));
            }
            if self.writes.load(Ordering::Acquire) != seen {
                log::trace!("node {id} was written during load, reloading");
                continue;
            }
            cache.insert(
                id,
                CachedNode {
                    node: Arc::clone(&node),
                    refs: 1,
                },
            );
            return Ok(node);
        }
    }

    fn release(&self, id: NodeId) -> Result<()> {
        let mut cache = self.cache.lock();
        match cache.get_mut(&id) {
            Some(cached) if cached.refs > 0 => cached.refs -= 1,
            _ => return Err(Error::storage(format!("release of {id} without acquire"))),
        }
        self.evict(&mut cache);
        Ok(())
    }

    fn persist(&self, node: &IndexNode) -> Result<()> {
        let mut buf = encode_node(node)?;
        if buf.len() > self.node_size {
            return Err(Error::invalid_argument(format!(
                "node {} needs {} bytes but slots hold {}",
                node.id(),
                buf.len(),
                self.node_size
            )));
        }
        buf.resize(self.node_size, 0);

        let id = node.id();
        let dir = self.owner_dir(id.owner_id);
        std::fs::create_dir_all(&dir)?;
        let block = id.address / self.store_config.nodes_per_block;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.block_path(id.owner_id, block))?;
        file.seek(SeekFrom::Start(self.slot_offset(id.address)))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        self.writes.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn last_address(&self, owner_id: u64) -> Result<u64> {
        let blocks = discover_blocks(&self.owner_dir(owner_id), owner_id)?;
        let per_block = self.store_config.nodes_per_block;
        for &block in blocks.iter().rev() {
            let Some(mut file) = self.open_block(owner_id, block)? else {
                continue;
            };
            let len = file.metadata()?.len();
            let first = (block * per_block).max(1);
            let last = block * per_block + per_block - 1;
            for address in (first..=last).rev() {
                let slot = self.read_slot_from(&mut file, len, address)?;
                if !is_empty_slot(&slot) {
                    return Ok(address);
                }
            }
        }
        Ok(0)
    }
}
