//! Post-order heap arithmetic.
//!
//! Nodes are numbered from 1 in the order their subtrees complete, so the
//! first `total_nodes(h, k)` addresses always form one complete subtree of
//! height `h` rooted at the last of them. Everything about the tree shape
//! (heights, children, the forest of open subtrees) follows from the address
//! alone; nothing here touches storage.

/// A complete subtree inside an address prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subtree {
    /// Address of the subtree's root (its highest address).
    pub root: u64,
    pub height: u32,
    /// Number of nodes in the subtree.
    pub size: u64,
}

impl Subtree {
    /// Lowest address inside the subtree.
    pub fn first(&self) -> u64 {
        self.root + 1 - self.size
    }
}

/// Nodes in a complete `arity`-ary subtree of `height` (a leaf has height 0):
/// `sum(arity^i, i = 0..=height)`. Saturates at `u64::MAX`.
pub fn total_nodes(height: u32, arity: usize) -> u64 {
    checked_total_nodes(height, arity).unwrap_or(u64::MAX)
}

fn checked_total_nodes(height: u32, arity: usize) -> Option<u64> {
    let k = arity as u64;
    let mut total: u64 = 1;
    for _ in 0..height {
        total = total.checked_mul(k)?.checked_add(1)?;
    }
    Some(total)
}

/// Height of the largest complete subtree that fits in the first
/// `node_count` addresses. Zero for an empty prefix.
pub fn height_of_root(node_count: u64, arity: usize) -> u32 {
    let mut height = 0;
    while let Some(total) = checked_total_nodes(height + 1, arity) {
        if total > node_count {
            break;
        }
        height += 1;
    }
    height
}

/// Height of the node at `address`. Address 0 is never assigned and is
/// reported as height 0.
pub fn height_of_node(address: u64, arity: usize) -> u32 {
    let mut remaining = address;
    while remaining > 0 {
        let height = height_of_root(remaining, arity);
        let size = total_nodes(height, arity);
        if remaining == size {
            return height;
        }
        remaining -= size;
    }
    0
}

/// Children of the node at `address` and `height`, oldest first.
pub fn child_addresses(address: u64, height: u32, arity: usize) -> Vec<u64> {
    if height == 0 || address == 0 {
        return Vec::new();
    }
    let child_size = total_nodes(height - 1, arity);
    let mut children: Vec<u64> = (0..arity as u64)
        .map_while(|j| {
            j.checked_mul(child_size)
                .and_then(|offset| (address - 1).checked_sub(offset))
                .filter(|&child| child > 0)
        })
        .collect();
    children.reverse();
    children
}

/// Splits the first `node_count` addresses into complete subtrees, oldest
/// (and tallest) first. These are the roots a reader must search when the
/// tree holds exactly `node_count` nodes.
pub fn decompose(node_count: u64, arity: usize) -> Vec<Subtree> {
    let mut subtrees = Vec::new();
    let mut remaining = node_count;
    let mut base = 0;
    while remaining > 0 {
        let height = height_of_root(remaining, arity);
        let size = total_nodes(height, arity);
        base += size;
        subtrees.push(Subtree {
            root: base,
            height,
            size,
        });
        remaining -= size;
    }
    subtrees
}
