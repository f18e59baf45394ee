//! Versioned B+-tree root.

use crate::btree::ctx::CreateOrUpdateCtx;
use crate::btree::cursor::{CursorStack, NodeIdxPair};
use crate::btree::node::{
    BTreeNode, InnerNode, LeafNode, ValueCoords, MAX_MEMBERS, MIN_MEMBERS,
};
use crate::btree::FindResult;
use crate::key;
use bytes::Bytes;
use std::sync::Arc;

/// Outcome of an insert into a subtree, reported to the parent frame.
enum InsertOutcome {
    /// The subtree absorbed the key, possibly after cloning nodes.
    Fit,
    /// The subtree split; the new right sibling and the separator that
    /// introduces it must be linked into the parent.
    Split {
        separator: Bytes,
        right: Arc<BTreeNode>,
    },
}

/// A versioned handle to a B+-tree plus transaction metadata.
///
/// A root published to readers is immutable; mutating operations are only
/// called on roots exclusively owned by the single writer. Mutations
/// clone every shared node on the touched path (`Arc::make_mut`), so an
/// older root keeps sharing all untouched subtrees with the new one.
#[derive(Debug, Clone, Default)]
pub struct RootNode {
    transaction_id: u64,
    trlog_file_id: u32,
    trlog_offset: u32,
    commit_ulong: u64,
    ulongs: Option<Vec<u64>>,
    description_for_leaks: Option<String>,
    tree: Option<Arc<BTreeNode>>,
}

impl RootNode {
    /// Creates an empty root with transaction id 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clones this root into a writable one for the given transaction,
    /// sharing the whole tree with this root.
    pub(crate) fn new_writable(&self, transaction_id: u64) -> Self {
        Self {
            transaction_id,
            trlog_file_id: self.trlog_file_id,
            trlog_offset: self.trlog_offset,
            commit_ulong: self.commit_ulong,
            ulongs: self.ulongs.clone(),
            description_for_leaks: None,
            tree: self.tree.clone(),
        }
    }

    /// The transaction id this root was produced by.
    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Log segment of the commit record that published this root.
    #[must_use]
    pub fn trlog_file_id(&self) -> u32 {
        self.trlog_file_id
    }

    /// Offset of the commit record that published this root.
    #[must_use]
    pub fn trlog_offset(&self) -> u32 {
        self.trlog_offset
    }

    pub(crate) fn set_trlog_position(&mut self, file_id: u32, offset: u32) {
        self.trlog_file_id = file_id;
        self.trlog_offset = offset;
    }

    /// The user-visible 64-bit value swapped atomically at commit.
    #[must_use]
    pub fn commit_ulong(&self) -> u64 {
        self.commit_ulong
    }

    pub(crate) fn set_commit_ulong(&mut self, value: u64) {
        self.commit_ulong = value;
    }

    /// The user-addressable 64-bit slot at `idx`, or 0 when unset.
    #[must_use]
    pub fn get_ulong(&self, idx: u32) -> u64 {
        self.ulongs
            .as_ref()
            .and_then(|u| u.get(idx as usize).copied())
            .unwrap_or(0)
    }

    pub(crate) fn set_ulong(&mut self, idx: u32, value: u64) {
        let slots = self.ulongs.get_or_insert_with(Vec::new);
        if slots.len() <= idx as usize {
            slots.resize(idx as usize + 1, 0);
        }
        slots[idx as usize] = value;
    }

    /// Number of allocated ulong slots.
    #[must_use]
    pub fn ulong_count(&self) -> u32 {
        self.ulongs.as_ref().map_or(0, |u| u.len() as u32)
    }

    pub(crate) fn ulongs(&self) -> Option<&[u64]> {
        self.ulongs.as_deref()
    }

    pub(crate) fn set_ulongs(&mut self, ulongs: Option<Vec<u64>>) {
        self.ulongs = ulongs;
    }

    /// Label included in leak reports for this root.
    #[must_use]
    pub fn description_for_leaks(&self) -> Option<&str> {
        self.description_for_leaks.as_deref()
    }

    pub(crate) fn set_description_for_leaks(&mut self, description: Option<String>) {
        self.description_for_leaks = description;
    }

    /// Total number of keys in the tree.
    #[must_use]
    pub fn calc_key_count(&self) -> u64 {
        self.tree.as_ref().map_or(0, |node| node.key_count())
    }

    /// Searches for `prefix || key` and positions the cursor.
    ///
    /// Returns the find outcome and the absolute index of the cursor
    /// position (`-1` for [`FindResult::NotFound`]). When no exact match
    /// exists the greatest smaller key within the prefix is preferred
    /// over the smallest greater one.
    pub fn find_key(
        &self,
        stack: &mut CursorStack,
        prefix: &[u8],
        search_key: &[u8],
    ) -> (FindResult, i64) {
        stack.clear();
        let count = self.calc_key_count();
        if count == 0 {
            return (FindResult::NotFound, -1);
        }
        let whole = key::concat(prefix, search_key);
        let lower = self.lower_bound_index(&whole);
        if lower < count {
            if let Some(found) = self.key_at(lower) {
                if found == whole {
                    self.fill_stack_by_index(stack, lower);
                    return (FindResult::Exact, lower as i64);
                }
            }
        }
        if lower > 0 {
            if let Some(found) = self.key_at(lower - 1) {
                if key::starts_with(&found, prefix) {
                    self.fill_stack_by_index(stack, lower - 1);
                    return (FindResult::Previous, (lower - 1) as i64);
                }
            }
        }
        if lower < count {
            if let Some(found) = self.key_at(lower) {
                if key::starts_with(&found, prefix) {
                    self.fill_stack_by_index(stack, lower);
                    return (FindResult::Next, lower as i64);
                }
            }
        }
        (FindResult::NotFound, -1)
    }

    /// Absolute index of the first key greater than or equal to `whole`.
    /// Equals the key count when every key is smaller.
    fn lower_bound_index(&self, whole: &[u8]) -> u64 {
        let mut node = match &self.tree {
            Some(node) => Arc::clone(node),
            None => return 0,
        };
        let mut index = 0u64;
        loop {
            let next = match node.as_ref() {
                BTreeNode::Inner(inner) => {
                    let child = inner.child_for_key(whole);
                    index += inner.counts[..child].iter().sum::<u64>();
                    Arc::clone(&inner.children[child])
                }
                BTreeNode::Leaf(leaf) => {
                    return index + leaf.keys.partition_point(|k| k.as_ref() < whole) as u64;
                }
            };
            node = next;
        }
    }

    /// Key at the given absolute index.
    #[must_use]
    pub fn key_at(&self, index: u64) -> Option<Bytes> {
        let mut node = Arc::clone(self.tree.as_ref()?);
        let mut idx = index;
        loop {
            let next = match node.as_ref() {
                BTreeNode::Inner(inner) => {
                    let (child, local) = inner.locate_index(idx)?;
                    idx = local;
                    Arc::clone(&inner.children[child])
                }
                BTreeNode::Leaf(leaf) => return leaf.keys.get(idx as usize).cloned(),
            };
            node = next;
        }
    }

    /// Rebuilds the cursor path to the given absolute index using the
    /// per-child subtree counts. Returns `false` when out of range.
    pub fn fill_stack_by_index(&self, stack: &mut CursorStack, index: u64) -> bool {
        stack.clear();
        let mut node = match &self.tree {
            Some(node) => Arc::clone(node),
            None => return false,
        };
        let mut idx = index;
        loop {
            let next = match node.as_ref() {
                BTreeNode::Inner(inner) => {
                    let Some((child, local)) = inner.locate_index(idx) else {
                        stack.clear();
                        return false;
                    };
                    let next = Arc::clone(&inner.children[child]);
                    stack.push(NodeIdxPair {
                        node: Arc::clone(&node),
                        idx: child,
                    });
                    idx = local;
                    next
                }
                BTreeNode::Leaf(leaf) => {
                    if idx as usize >= leaf.keys.len() {
                        stack.clear();
                        return false;
                    }
                    stack.push(NodeIdxPair {
                        node,
                        idx: idx as usize,
                    });
                    return true;
                }
            };
            node = next;
        }
    }

    /// Absolute index of the last key starting with `prefix`, if any.
    #[must_use]
    pub fn find_last_with_prefix(&self, prefix: &[u8]) -> Option<u64> {
        let count = self.calc_key_count();
        if count == 0 {
            return None;
        }
        let end = match key::prefix_successor(prefix) {
            Some(successor) => self.lower_bound_index(&successor),
            None => count,
        };
        if end == 0 {
            return None;
        }
        let candidate = end - 1;
        let found = self.key_at(candidate)?;
        key::starts_with(&found, prefix).then_some(candidate)
    }

    /// Inserts or updates `ctx.key_prefix || ctx.key`.
    ///
    /// Fills `ctx.created`, `ctx.key_index` and `ctx.old_value`. The
    /// touched path is cloned unless this writer already owns it.
    pub fn create_or_update(&mut self, ctx: &mut CreateOrUpdateCtx) {
        let whole = ctx.whole_key();
        match &mut self.tree {
            None => {
                self.tree = Some(Arc::new(BTreeNode::Leaf(LeafNode {
                    keys: vec![whole],
                    values: vec![ctx.value],
                })));
                ctx.created = true;
                ctx.key_index = 0;
                ctx.old_value = None;
            }
            Some(root) => {
                if let InsertOutcome::Split { separator, right } =
                    Self::insert_into(root, &whole, 0, ctx)
                {
                    let left = Arc::clone(root);
                    let counts = vec![left.key_count(), right.key_count()];
                    *root = Arc::new(BTreeNode::Inner(InnerNode {
                        separators: vec![separator],
                        children: vec![left, right],
                        counts,
                    }));
                }
            }
        }
    }

    fn insert_into(
        node: &mut Arc<BTreeNode>,
        whole: &Bytes,
        base: u64,
        ctx: &mut CreateOrUpdateCtx,
    ) -> InsertOutcome {
        match Arc::make_mut(node) {
            BTreeNode::Leaf(leaf) => {
                let pos = leaf.keys.partition_point(|k| k.as_ref() < whole.as_ref());
                if pos < leaf.keys.len() && leaf.keys[pos] == *whole {
                    ctx.created = false;
                    ctx.old_value = Some(leaf.values[pos]);
                    ctx.key_index = base + pos as u64;
                    leaf.values[pos] = ctx.value;
                    return InsertOutcome::Fit;
                }
                ctx.created = true;
                ctx.old_value = None;
                ctx.key_index = base + pos as u64;
                leaf.keys.insert(pos, whole.clone());
                leaf.values.insert(pos, ctx.value);
                if leaf.keys.len() <= MAX_MEMBERS {
                    return InsertOutcome::Fit;
                }
                let mid = leaf.keys.len() / 2;
                let right = LeafNode {
                    keys: leaf.keys.split_off(mid),
                    values: leaf.values.split_off(mid),
                };
                let separator = right.keys[0].clone();
                InsertOutcome::Split {
                    separator,
                    right: Arc::new(BTreeNode::Leaf(right)),
                }
            }
            BTreeNode::Inner(inner) => {
                let child = inner.child_for_key(whole.as_ref());
                let child_base = base + inner.counts[..child].iter().sum::<u64>();
                let outcome = Self::insert_into(&mut inner.children[child], whole, child_base, ctx);
                inner.counts[child] = inner.children[child].key_count();
                if let InsertOutcome::Split { separator, right } = outcome {
                    inner.separators.insert(child, separator);
                    inner.counts.insert(child + 1, right.key_count());
                    inner.children.insert(child + 1, right);
                    inner.counts[child] = inner.children[child].key_count();
                    if inner.children.len() <= MAX_MEMBERS {
                        return InsertOutcome::Fit;
                    }
                    let mid = inner.children.len() / 2;
                    let right_children = inner.children.split_off(mid);
                    let right_counts = inner.counts.split_off(mid);
                    let mut right_separators = inner.separators.split_off(mid - 1);
                    let promoted = right_separators.remove(0);
                    return InsertOutcome::Split {
                        separator: promoted,
                        right: Arc::new(BTreeNode::Inner(InnerNode {
                            separators: right_separators,
                            children: right_children,
                            counts: right_counts,
                        })),
                    };
                }
                InsertOutcome::Fit
            }
        }
    }

    /// Replaces the value coordinates at the given absolute index,
    /// returning the previous coordinates.
    pub(crate) fn set_value_at_index(
        &mut self,
        index: u64,
        value: ValueCoords,
    ) -> Option<ValueCoords> {
        let root = self.tree.as_mut()?;
        Self::set_value_in(root, index, value)
    }

    fn set_value_in(
        node: &mut Arc<BTreeNode>,
        index: u64,
        value: ValueCoords,
    ) -> Option<ValueCoords> {
        match Arc::make_mut(node) {
            BTreeNode::Inner(inner) => {
                let (child, local) = inner.locate_index(index)?;
                Self::set_value_in(&mut inner.children[child], local, value)
            }
            BTreeNode::Leaf(leaf) => {
                let slot = leaf.values.get_mut(index as usize)?;
                let old = *slot;
                *slot = value;
                Some(old)
            }
        }
    }

    /// Erases the inclusive absolute index range `[first, last]`,
    /// clamped to the tree; out-of-range or inverted ranges are ignored.
    pub fn erase_range(&mut self, first: u64, last: u64) {
        let count = self.calc_key_count();
        if count == 0 || first > last || first >= count {
            return;
        }
        let last = last.min(count - 1);
        if first == 0 && last == count - 1 {
            self.tree = None;
            return;
        }
        if let Some(root) = &mut self.tree {
            Self::erase_in(root, first, last);
            // collapse single-child roots left behind by merges
            loop {
                let collapsed = match root.as_ref() {
                    BTreeNode::Inner(inner) if inner.children.len() == 1 => {
                        Some(Arc::clone(&inner.children[0]))
                    }
                    _ => None,
                };
                match collapsed {
                    Some(only_child) => *root = only_child,
                    None => break,
                }
            }
        }
    }

    fn erase_in(node: &mut Arc<BTreeNode>, first: u64, last: u64) {
        match Arc::make_mut(node) {
            BTreeNode::Leaf(leaf) => {
                let lo = first as usize;
                let hi = last as usize;
                leaf.keys.drain(lo..=hi);
                leaf.values.drain(lo..=hi);
            }
            BTreeNode::Inner(inner) => {
                // child ranges are tracked in the pre-erase index space
                let mut base = 0u64;
                let mut child = 0usize;
                while child < inner.children.len() {
                    let child_count = inner.counts[child];
                    let lo = base;
                    let hi = base + child_count;
                    if hi <= first || lo > last {
                        base = hi;
                        child += 1;
                        continue;
                    }
                    if first <= lo && last >= hi - 1 {
                        inner.children.remove(child);
                        inner.counts.remove(child);
                        if child == 0 {
                            if !inner.separators.is_empty() {
                                inner.separators.remove(0);
                            }
                        } else {
                            inner.separators.remove(child - 1);
                        }
                        base = hi;
                        continue;
                    }
                    let sub_first = first.max(lo) - lo;
                    let sub_last = last.min(hi - 1) - lo;
                    Self::erase_in(&mut inner.children[child], sub_first, sub_last);
                    inner.counts[child] = inner.children[child].key_count();
                    if child > 0 {
                        if let Some(new_first) = inner.children[child].first_key() {
                            inner.separators[child - 1] = new_first;
                        }
                    }
                    base = hi;
                    child += 1;
                }
                Self::rebalance_children(inner);
            }
        }
    }

    fn rebalance_children(inner: &mut InnerNode) {
        let mut child = 0usize;
        while child < inner.children.len() {
            if inner.children.len() == 1 || inner.children[child].member_count() >= MIN_MEMBERS {
                child += 1;
                continue;
            }
            let (left, right) = if child + 1 < inner.children.len() {
                (child, child + 1)
            } else {
                (child - 1, child)
            };
            let combined =
                inner.children[left].member_count() + inner.children[right].member_count();
            if combined <= MAX_MEMBERS {
                Self::merge_children(inner, left);
                child = left;
            } else {
                Self::redistribute_children(inner, left);
                child += 1;
            }
        }
    }

    /// Merges `children[left]` and `children[left + 1]` into one node.
    fn merge_children(inner: &mut InnerNode, left: usize) {
        let separator = inner.separators[left].clone();
        let merged = match (inner.children[left].as_ref(), inner.children[left + 1].as_ref()) {
            (BTreeNode::Leaf(l), BTreeNode::Leaf(r)) => BTreeNode::Leaf(LeafNode {
                keys: l.keys.iter().chain(r.keys.iter()).cloned().collect(),
                values: l.values.iter().chain(r.values.iter()).cloned().collect(),
            }),
            (BTreeNode::Inner(l), BTreeNode::Inner(r)) => BTreeNode::Inner(InnerNode {
                separators: l
                    .separators
                    .iter()
                    .cloned()
                    .chain(std::iter::once(separator))
                    .chain(r.separators.iter().cloned())
                    .collect(),
                children: l.children.iter().chain(r.children.iter()).cloned().collect(),
                counts: l.counts.iter().chain(r.counts.iter()).copied().collect(),
            }),
            // siblings always share a variant
            _ => return,
        };
        inner.children[left] = Arc::new(merged);
        inner.counts[left] += inner.counts[left + 1];
        inner.children.remove(left + 1);
        inner.counts.remove(left + 1);
        inner.separators.remove(left);
    }

    /// Evens out members between `children[left]` and `children[left + 1]`
    /// when merging them would overflow a node.
    fn redistribute_children(inner: &mut InnerNode, left: usize) {
        let left_node = Arc::clone(&inner.children[left]);
        let right_node = Arc::clone(&inner.children[left + 1]);
        let separator = inner.separators[left].clone();
        let (new_left, new_separator, new_right) = match (left_node.as_ref(), right_node.as_ref())
        {
            (BTreeNode::Leaf(l), BTreeNode::Leaf(r)) => {
                let mut keys: Vec<Bytes> = l.keys.iter().chain(r.keys.iter()).cloned().collect();
                let mut values: Vec<ValueCoords> =
                    l.values.iter().chain(r.values.iter()).cloned().collect();
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_values = values.split_off(mid);
                let new_separator = right_keys[0].clone();
                (
                    BTreeNode::Leaf(LeafNode { keys, values }),
                    new_separator,
                    BTreeNode::Leaf(LeafNode {
                        keys: right_keys,
                        values: right_values,
                    }),
                )
            }
            (BTreeNode::Inner(l), BTreeNode::Inner(r)) => {
                let mut separators: Vec<Bytes> = l
                    .separators
                    .iter()
                    .cloned()
                    .chain(std::iter::once(separator))
                    .chain(r.separators.iter().cloned())
                    .collect();
                let mut children: Vec<Arc<BTreeNode>> =
                    l.children.iter().chain(r.children.iter()).cloned().collect();
                let mut counts: Vec<u64> =
                    l.counts.iter().chain(r.counts.iter()).copied().collect();
                let mid = children.len() / 2;
                let right_children = children.split_off(mid);
                let right_counts = counts.split_off(mid);
                let mut right_separators = separators.split_off(mid - 1);
                let promoted = right_separators.remove(0);
                (
                    BTreeNode::Inner(InnerNode {
                        separators,
                        children,
                        counts,
                    }),
                    promoted,
                    BTreeNode::Inner(InnerNode {
                        separators: right_separators,
                        children: right_children,
                        counts: right_counts,
                    }),
                )
            }
            _ => return,
        };
        inner.children[left] = Arc::new(new_left);
        inner.children[left + 1] = Arc::new(new_right);
        inner.separators[left] = new_separator;
        inner.counts[left] = inner.children[left].key_count();
        inner.counts[left + 1] = inner.children[left + 1].key_count();
    }
}
