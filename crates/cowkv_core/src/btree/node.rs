//! B+-tree node variants.

use bytes::Bytes;
use std::sync::Arc;

/// Maximum number of members (keys in a leaf, children in an inner node)
/// per node. Nodes split when they would exceed this bound.
pub const MAX_MEMBERS: usize = 30;

/// A node falling below this bound after an erase is merged with a
/// sibling, or refilled from it when a merge would overflow.
pub(crate) const MIN_MEMBERS: usize = MAX_MEMBERS / 2;

/// Coordinates of value bytes in the append-only transaction log.
///
/// The tree treats the triple as opaque and preserves its bit pattern;
/// the meaning of negative sizes is owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueCoords {
    /// Log segment holding the value bytes.
    pub file_id: u32,
    /// Byte offset of the value within the segment.
    pub offset: u32,
    /// Value length; negative values are a coordinator-owned convention.
    pub size: i32,
}

/// A B+-tree node. Leaf and inner nodes are a closed set.
#[derive(Debug, Clone)]
pub enum BTreeNode {
    /// A leaf holding keys and value coordinates.
    Leaf(LeafNode),
    /// An inner node holding separators and child subtrees.
    Inner(InnerNode),
}

impl BTreeNode {
    /// Number of members: keys in a leaf, children in an inner node.
    pub(crate) fn member_count(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.keys.len(),
            Self::Inner(inner) => inner.children.len(),
        }
    }

    /// Number of leaf keys reachable beneath this node.
    pub(crate) fn key_count(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.keys.len() as u64,
            Self::Inner(inner) => inner.counts.iter().sum(),
        }
    }

    /// Smallest key in the subtree, if any.
    pub(crate) fn first_key(&self) -> Option<Bytes> {
        let mut node = self;
        loop {
            match node {
                Self::Leaf(leaf) => return leaf.keys.first().cloned(),
                Self::Inner(inner) => node = inner.children.first()?.as_ref(),
            }
        }
    }
}

/// Leaf node: sorted keys with their value coordinates.
#[derive(Debug, Clone, Default)]
pub struct LeafNode {
    /// Whole keys (prefix included), strictly increasing.
    pub(crate) keys: Vec<Bytes>,
    /// Value coordinates, parallel to `keys`.
    pub(crate) values: Vec<ValueCoords>,
}

/// Inner node: children with separators and per-child key counts.
///
/// `separators[i]` is the smallest key reachable under `children[i + 1]`;
/// `counts[i]` is the number of leaf keys beneath `children[i]`.
#[derive(Debug, Clone, Default)]
pub struct InnerNode {
    pub(crate) separators: Vec<Bytes>,
    pub(crate) children: Vec<Arc<BTreeNode>>,
    pub(crate) counts: Vec<u64>,
}

impl InnerNode {
    /// Index of the child whose key range contains `key`.
    pub(crate) fn child_for_key(&self, key: &[u8]) -> usize {
        self.separators.partition_point(|sep| sep.as_ref() <= key)
    }

    /// Resolves an absolute index within this subtree to
    /// `(child, index local to that child)`.
    pub(crate) fn locate_index(&self, index: u64) -> Option<(usize, u64)> {
        let mut remaining = index;
        for (child, &count) in self.counts.iter().enumerate() {
            if remaining < count {
                return Some((child, remaining));
            }
            remaining -= count;
        }
        None
    }
}
