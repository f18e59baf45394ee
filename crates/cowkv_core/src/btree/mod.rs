//! Copy-on-write B+-tree.
//!
//! The tree indexes byte-string keys and stores value coordinates in its
//! leaves. Nodes are immutable once a root is published to readers; a
//! writer clones every node on the path it touches, so an old root keeps
//! observing a consistent snapshot while a new root is produced. Nodes
//! created by the current writer are mutated in place.

mod ctx;
mod cursor;
mod node;
mod root;

pub use ctx::CreateOrUpdateCtx;
pub use cursor::{CursorStack, NodeIdxPair};
pub use node::{BTreeNode, ValueCoords, MAX_MEMBERS};
pub use root::RootNode;

pub(crate) use cursor::{current_key, current_value, find_next_key, find_previous_key};

/// Outcome of a key search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    /// A key equal to the searched key exists; the cursor points to it.
    Exact,
    /// No exact match; the cursor points at the greatest smaller key
    /// within the prefix scope.
    Previous,
    /// No exact match; the cursor points at the smallest greater key
    /// within the prefix scope.
    Next,
    /// No key within the prefix scope exists, or the tree is empty.
    NotFound,
}
