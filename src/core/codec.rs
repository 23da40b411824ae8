//! Persisted node layout.
//!
//! ```text
//! 0   magic u32 | version u32 | owner_id u64 | address u64
//! 24  role u8 | flags u8 | pad[2] | pointer_capacity u32 | entry_capacity u32 | count u32
//! 40  count x (min_ts i64, max_ts i64, value i64)
//! ..  crc32 u32 over everything before it
//! ```
//!
//! All integers are little-endian. Only the role's live list is stored.
//! Flag bit 0 marks a leaf whose last entry is still open.

use crate::core::node::{IndexNode, NodeId, NodeLayout, NodeRole};
use crate::core::{Error, Result, TimeRange};

pub const NODE_MAGIC: u32 = 0x504F_484E; // "POHN"
pub const NODE_VERSION: u32 = 1;
pub const NODE_HEADER_SIZE: usize = 40;
pub const NODE_TRAILER_SIZE: usize = 4;
pub const RANGE_SIZE: usize = 24;

const FLAG_OPEN_ENTRY: u8 = 0x01;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const OWNER_OFFSET: usize = 8;
const ADDRESS_OFFSET: usize = 16;
const ROLE_OFFSET: usize = 24;
const FLAGS_OFFSET: usize = 25;
const POINTER_CAP_OFFSET: usize = 28;
const ENTRY_CAP_OFFSET: usize = 32;
const COUNT_OFFSET: usize = 36;

/// Exact encoded size of a node holding `count` ranges.
pub fn encoded_len(count: usize) -> usize {
    NODE_HEADER_SIZE + count * RANGE_SIZE + NODE_TRAILER_SIZE
}

pub fn encode_node(node: &IndexNode) -> Result<Vec<u8>> {
    let layout = node.layout();
    let ranges = node.ranges().snapshot();
    let id = node.id();

    let pointer_capacity = u32::try_from(layout.pointer_capacity)
        .map_err(|_| Error::invalid_argument("pointer capacity does not fit in u32"))?;
    let entry_capacity = u32::try_from(layout.entry_capacity)
        .map_err(|_| Error::invalid_argument("entry capacity does not fit in u32"))?;
    let count = ranges.len() as u32;

    let mut buf = vec![0u8; encoded_len(ranges.len())];
    buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&NODE_MAGIC.to_le_bytes());
    buf[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&NODE_VERSION.to_le_bytes());
    buf[OWNER_OFFSET..OWNER_OFFSET + 8].copy_from_slice(&id.owner_id.to_le_bytes());
    buf[ADDRESS_OFFSET..ADDRESS_OFFSET + 8].copy_from_slice(&id.address.to_le_bytes());
    buf[ROLE_OFFSET] = layout.role.to_byte();
    if node.has_open_entry() {
        buf[FLAGS_OFFSET] = FLAG_OPEN_ENTRY;
    }
    buf[POINTER_CAP_OFFSET..POINTER_CAP_OFFSET + 4].copy_from_slice(&pointer_capacity.to_le_bytes());
    buf[ENTRY_CAP_OFFSET..ENTRY_CAP_OFFSET + 4].copy_from_slice(&entry_capacity.to_le_bytes());
    buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&count.to_le_bytes());

    let mut offset = NODE_HEADER_SIZE;
    for range in ranges.iter() {
        buf[offset..offset + 8].copy_from_slice(&range.min_ts.to_le_bytes());
        buf[offset + 8..offset + 16].copy_from_slice(&range.max_ts.to_le_bytes());
        buf[offset + 16..offset + 24].copy_from_slice(&range.value.to_le_bytes());
        offset += RANGE_SIZE;
    }

    let crc = crc32(&buf[..offset]);
    buf[offset..offset + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// True if `buf` holds no node (a never-written slot reads back as zeros).
pub fn is_empty_slot(buf: &[u8]) -> bool {
    buf.len() < 4 || buf[MAGIC_OFFSET..MAGIC_OFFSET + 4] == [0u8; 4]
}

/// Decodes a node, ignoring any slot padding after the checksum.
///
/// When `expected` is given the stored identity must match it.
pub fn decode_node(buf: &[u8], expected: Option<NodeId>) -> Result<IndexNode> {
    if buf.len() < NODE_HEADER_SIZE + NODE_TRAILER_SIZE {
        return Err(Error::Corrupt("node buffer too small"));
    }
    let magic = read_u32(buf, MAGIC_OFFSET);
    if magic != NODE_MAGIC {
        return Err(Error::Corrupt("node magic mismatch"));
    }
    let version = read_u32(buf, VERSION_OFFSET);
    if version != NODE_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let id = NodeId::new(read_u64(buf, OWNER_OFFSET), read_u64(buf, ADDRESS_OFFSET));
    if let Some(expected) = expected {
        if expected != id {
            return Err(Error::Corrupt("node identity mismatch"));
        }
    }
    let role = NodeRole::from_byte(buf[ROLE_OFFSET]).ok_or(Error::Corrupt("unknown node role"))?;
    let layout = NodeLayout {
        role,
        pointer_capacity: read_u32(buf, POINTER_CAP_OFFSET) as usize,
        entry_capacity: read_u32(buf, ENTRY_CAP_OFFSET) as usize,
    };
    let flags = buf[FLAGS_OFFSET];
    if flags & !FLAG_OPEN_ENTRY != 0 {
        return Err(Error::Corrupt("unknown node flags"));
    }
    let open_entry = flags & FLAG_OPEN_ENTRY != 0;
    let count = read_u32(buf, COUNT_OFFSET) as usize;
    if open_entry && (role != NodeRole::Leaf || count == 0) {
        return Err(Error::Corrupt("open entry flag on a node without entries"));
    }
    let capacity = match role {
        NodeRole::Leaf => layout.entry_capacity,
        NodeRole::Internal => layout.pointer_capacity,
    };
    if count > capacity {
        return Err(Error::Corrupt("node count exceeds capacity"));
    }
    let end = NODE_HEADER_SIZE + count * RANGE_SIZE;
    if buf.len() < end + NODE_TRAILER_SIZE {
        return Err(Error::Corrupt("node buffer truncated"));
    }
    if read_u32(buf, end) != crc32(&buf[..end]) {
        return Err(Error::Corrupt("node crc mismatch"));
    }

    let node = IndexNode::new(id, layout);
    let last_offset = end - RANGE_SIZE;
    for offset in (NODE_HEADER_SIZE..end).step_by(RANGE_SIZE) {
        let range = TimeRange::new(
            read_i64(buf, offset),
            read_i64(buf, offset + 8),
            read_i64(buf, offset + 16),
        );
        let appended = match role {
            NodeRole::Leaf if open_entry && offset == last_offset => {
                node.append_open_entry(range.min_ts, range.value)
            }
            NodeRole::Leaf => node.append_entry(range.min_ts, range.max_ts, range.value),
            NodeRole::Internal => {
                let child = u64::try_from(range.value)
                    .map_err(|_| Error::Corrupt("negative child address"))?;
                node.append_pointer(range.min_ts, range.max_ts, child)
            }
        };
        appended.map_err(|_| Error::Corrupt("node ranges out of order"))?;
    }
    Ok(node)
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("slice length"))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("slice length"))
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().expect("slice length"))
}
