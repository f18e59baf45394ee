//! Cursor stack over a B+-tree.
//!
//! A cursor is the root-to-leaf path plus the key slot in the top leaf.
//! Stepping is explicit stack manipulation: exhausted frames are popped
//! and the next subtree is entered at its first (or last) leaf, without
//! re-descending from the root in the common case.

use crate::btree::node::{BTreeNode, ValueCoords};
use bytes::Bytes;
use std::sync::Arc;

/// One frame of the cursor path: a node and the index taken within it
/// (child index for inner nodes, key slot for the leaf on top).
#[derive(Debug, Clone)]
pub struct NodeIdxPair {
    /// The node at this level.
    pub node: Arc<BTreeNode>,
    /// Index taken within the node.
    pub idx: usize,
}

/// A root-to-leaf cursor path.
pub type CursorStack = Vec<NodeIdxPair>;

/// Key at the current cursor position.
pub(crate) fn current_key(stack: &CursorStack) -> Option<Bytes> {
    let top = stack.last()?;
    match top.node.as_ref() {
        BTreeNode::Leaf(leaf) => leaf.keys.get(top.idx).cloned(),
        BTreeNode::Inner(_) => None,
    }
}

/// Value coordinates at the current cursor position.
pub(crate) fn current_value(stack: &CursorStack) -> Option<ValueCoords> {
    let top = stack.last()?;
    match top.node.as_ref() {
        BTreeNode::Leaf(leaf) => leaf.values.get(top.idx).copied(),
        BTreeNode::Inner(_) => None,
    }
}

/// Steps the cursor to the next key.
///
/// Returns `false` at the end of the tree; the stack contents are
/// unspecified afterwards and the caller is expected to invalidate.
pub(crate) fn find_next_key(stack: &mut CursorStack) -> bool {
    match stack.last_mut() {
        Some(top) => {
            if let BTreeNode::Leaf(leaf) = top.node.as_ref() {
                if top.idx + 1 < leaf.keys.len() {
                    top.idx += 1;
                    return true;
                }
            }
        }
        None => return false,
    }
    stack.pop();
    while let Some(frame) = stack.last_mut() {
        let NodeIdxPair {
            ref node,
            ref mut idx,
        } = *frame;
        let next = match node.as_ref() {
            BTreeNode::Inner(inner) if *idx + 1 < inner.children.len() => {
                *idx += 1;
                Some(Arc::clone(&inner.children[*idx]))
            }
            _ => None,
        };
        match next {
            Some(child) => {
                push_first_path(stack, child);
                return true;
            }
            None => {
                stack.pop();
            }
        }
    }
    false
}

/// Steps the cursor to the previous key.
///
/// Returns `false` at the start of the tree; the stack contents are
/// unspecified afterwards and the caller is expected to invalidate.
pub(crate) fn find_previous_key(stack: &mut CursorStack) -> bool {
    match stack.last_mut() {
        Some(top) => {
            if matches!(top.node.as_ref(), BTreeNode::Leaf(_)) && top.idx > 0 {
                top.idx -= 1;
                return true;
            }
        }
        None => return false,
    }
    stack.pop();
    while let Some(frame) = stack.last_mut() {
        let NodeIdxPair {
            ref node,
            ref mut idx,
        } = *frame;
        let prev = match node.as_ref() {
            BTreeNode::Inner(inner) if *idx > 0 => {
                *idx -= 1;
                Some(Arc::clone(&inner.children[*idx]))
            }
            _ => None,
        };
        match prev {
            Some(child) => {
                push_last_path(stack, child);
                return true;
            }
            None => {
                stack.pop();
            }
        }
    }
    false
}

/// Pushes the path to the first key of `node` onto the stack.
fn push_first_path(stack: &mut CursorStack, mut node: Arc<BTreeNode>) {
    loop {
        let next = match node.as_ref() {
            BTreeNode::Inner(inner) => {
                let child = Arc::clone(&inner.children[0]);
                stack.push(NodeIdxPair {
                    node: Arc::clone(&node),
                    idx: 0,
                });
                child
            }
            BTreeNode::Leaf(_) => {
                stack.push(NodeIdxPair { node, idx: 0 });
                return;
            }
        };
        node = next;
    }
}

/// Pushes the path to the last key of `node` onto the stack.
fn push_last_path(stack: &mut CursorStack, mut node: Arc<BTreeNode>) {
    loop {
        let next = match node.as_ref() {
            BTreeNode::Inner(inner) => {
                let idx = inner.children.len().saturating_sub(1);
                let child = Arc::clone(&inner.children[idx]);
                stack.push(NodeIdxPair {
                    node: Arc::clone(&node),
                    idx,
                });
                child
            }
            BTreeNode::Leaf(leaf) => {
                let idx = leaf.keys.len().saturating_sub(1);
                stack.push(NodeIdxPair { node, idx });
                return;
            }
        };
        node = next;
    }
}
