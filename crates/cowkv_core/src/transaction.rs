//! Transactions: cursor, prefix scoping and writer promotion.

use crate::btree::{
    current_key, current_value, find_next_key, find_previous_key, CreateOrUpdateCtx, CursorStack,
    FindResult, RootNode,
};
use crate::database::KeyValueDb;
use crate::error::{KvError, KvResult};
use crate::key;
use bytes::Bytes;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::warn;

/// Root snapshot held by a transaction.
enum RootHandle {
    /// Shared snapshot of a committed root.
    Reader(Arc<RootNode>),
    /// Exclusively owned root of the single writer.
    Writer(Box<RootNode>),
    /// Committed or disposed.
    Closed,
}

impl RootHandle {
    fn as_root(&self) -> KvResult<&RootNode> {
        match self {
            Self::Reader(root) => Ok(root),
            Self::Writer(root) => Ok(root),
            Self::Closed => Err(KvError::TransactionClosed),
        }
    }

    fn as_root_mut(&mut self) -> KvResult<&mut RootNode> {
        match self {
            Self::Writer(root) => Ok(root),
            Self::Reader(_) => Err(KvError::invalid_operation(
                "transaction is not writable, promote it first",
            )),
            Self::Closed => Err(KvError::TransactionClosed),
        }
    }
}

/// A transaction over one root snapshot.
///
/// Starts out reading and promotes itself to the single writer on the
/// first mutating call, unless it was started read-only or preapproved
/// for writing. All cursor and counting operations are scoped by the
/// key prefix installed with [`set_key_prefix`](Self::set_key_prefix).
///
/// Dropping a transaction without [`commit`](Self::commit) reverts any
/// pending writes.
pub struct KvTransaction<'db> {
    db: &'db KeyValueDb,
    root: RootHandle,
    stack: CursorStack,
    prefix: Bytes,
    writing: bool,
    read_only: bool,
    preapproved_writing: bool,
    /// Absolute index of the first key >= prefix; -1 until computed.
    prefix_key_start: i64,
    /// Cached key count within the prefix; negative means stale.
    prefix_key_count: i64,
    /// Absolute cursor index; -1 means invalid.
    key_index: i64,
    temporary_close_log: bool,
    description_for_leaks: Option<String>,
    writer_guard: Option<MutexGuard<'db, ()>>,
}

impl<'db> KvTransaction<'db> {
    pub(crate) fn new_reader(db: &'db KeyValueDb, root: Arc<RootNode>, read_only: bool) -> Self {
        Self {
            db,
            root: RootHandle::Reader(root),
            stack: CursorStack::new(),
            prefix: Bytes::new(),
            writing: false,
            read_only,
            preapproved_writing: false,
            prefix_key_start: 0,
            prefix_key_count: -1,
            key_index: -1,
            temporary_close_log: false,
            description_for_leaks: None,
            writer_guard: None,
        }
    }

    pub(crate) fn new_preapproved(
        db: &'db KeyValueDb,
        root: RootNode,
        guard: MutexGuard<'db, ()>,
    ) -> Self {
        Self {
            db,
            root: RootHandle::Writer(Box::new(root)),
            stack: CursorStack::new(),
            prefix: Bytes::new(),
            writing: false,
            read_only: false,
            preapproved_writing: true,
            prefix_key_start: 0,
            prefix_key_count: -1,
            key_index: -1,
            temporary_close_log: false,
            description_for_leaks: None,
            writer_guard: Some(guard),
        }
    }

    /// Installs a byte prefix scoping all cursor and counting operations.
    ///
    /// An empty prefix means unscoped. Invalidates the cursor and drops
    /// the cached prefix bookkeeping.
    pub fn set_key_prefix(&mut self, prefix: &[u8]) {
        self.prefix = Bytes::copy_from_slice(prefix);
        self.prefix_key_start = if prefix.is_empty() { 0 } else { -1 };
        self.prefix_key_count = -1;
        self.invalidate_current_key();
    }

    /// The active key prefix.
    #[must_use]
    pub fn get_key_prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Positions the cursor at the first key within the prefix.
    pub fn find_first_key(&mut self) -> KvResult<bool> {
        self.set_key_index(0)
    }

    /// Positions the cursor at the last key within the prefix.
    pub fn find_last_key(&mut self) -> KvResult<bool> {
        let count = self.get_key_value_count()? as i64;
        self.set_key_index(count - 1)
    }

    /// Steps the cursor forward; behaves like
    /// [`find_first_key`](Self::find_first_key) when the cursor is
    /// invalid. Returns `false` and invalidates the cursor when the next
    /// key leaves the prefix.
    pub fn find_next_key(&mut self) -> KvResult<bool> {
        if self.key_index < 0 {
            return self.find_first_key();
        }
        if find_next_key(&mut self.stack) {
            if let Some(found) = current_key(&self.stack) {
                if key::starts_with(&found, &self.prefix) {
                    self.key_index += 1;
                    return Ok(true);
                }
            }
        }
        self.invalidate_current_key();
        Ok(false)
    }

    /// Steps the cursor backward; behaves like
    /// [`find_last_key`](Self::find_last_key) when the cursor is invalid.
    pub fn find_previous_key(&mut self) -> KvResult<bool> {
        if self.key_index < 0 {
            return self.find_last_key();
        }
        if find_previous_key(&mut self.stack) {
            if let Some(found) = current_key(&self.stack) {
                if key::starts_with(&found, &self.prefix) {
                    self.key_index -= 1;
                    return Ok(true);
                }
            }
        }
        self.invalidate_current_key();
        Ok(false)
    }

    /// Searches for `prefix || key` and positions the cursor.
    pub fn find(&mut self, search_key: &[u8]) -> KvResult<FindResult> {
        let (result, index) =
            self.root
                .as_root()?
                .find_key(&mut self.stack, &self.prefix, search_key);
        self.key_index = index;
        Ok(result)
    }

    /// Positions the cursor at `prefix || key` only on an exact match.
    pub fn find_exact_key(&mut self, search_key: &[u8]) -> KvResult<bool> {
        if self.find(search_key)? == FindResult::Exact {
            return Ok(true);
        }
        self.invalidate_current_key();
        Ok(false)
    }

    /// Inserts or updates `prefix || key`, promoting to writer.
    ///
    /// Returns whether the key was created. The value bytes go into the
    /// transaction log first; the tree stores only their coordinates.
    pub fn create_or_update(&mut self, search_key: &[u8], value: &[u8]) -> KvResult<bool> {
        self.make_writable()?;
        let search_key = Bytes::copy_from_slice(search_key);
        let coords = self.db.write_create_or_update_command(
            self.prefix.clone(),
            search_key.clone(),
            Bytes::copy_from_slice(value),
        )?;
        let mut ctx = CreateOrUpdateCtx::new(self.prefix.clone(), search_key, coords);
        self.root.as_root_mut()?.create_or_update(&mut ctx);
        self.key_index = ctx.key_index as i64;
        self.root
            .as_root()?
            .fill_stack_by_index(&mut self.stack, ctx.key_index);
        if ctx.created && self.prefix_key_count >= 0 {
            self.prefix_key_count += 1;
        }
        Ok(ctx.created)
    }

    /// The current key with the prefix stripped; empty when the cursor
    /// is invalid.
    #[must_use]
    pub fn get_key(&self) -> Bytes {
        if self.key_index < 0 {
            return Bytes::new();
        }
        match current_key(&self.stack) {
            Some(found) => found.slice(self.prefix.len()..),
            None => Bytes::new(),
        }
    }

    /// The current key including the prefix; empty when the cursor is
    /// invalid.
    #[must_use]
    pub fn get_key_with_prefix(&self) -> Bytes {
        if self.key_index < 0 {
            return Bytes::new();
        }
        current_key(&self.stack).unwrap_or_default()
    }

    /// Reads the value bytes at the cursor from the transaction log.
    ///
    /// A failed read is wrapped with a snapshot of current, last
    /// committed and oldest live root metadata.
    pub fn get_value(&mut self) -> KvResult<Vec<u8>> {
        if self.key_index < 0 {
            return Err(KvError::InvalidCursor);
        }
        let coords = current_value(&self.stack).ok_or(KvError::InvalidCursor)?;
        match self.db.read_value(coords) {
            Ok(value) => Ok(value),
            Err(e) => {
                let current = self.root.as_root()?;
                let last = self.db.last_committed_root();
                let oldest = self.db.oldest_live_root();
                Err(KvError::value_read(format!(
                    "reading value at segment {} offset {} size {} failed: {e}; \
                     current root {}, last committed {}, oldest live {}",
                    coords.file_id,
                    coords.offset,
                    coords.size,
                    describe_root(current),
                    describe_root(&last),
                    describe_root(&oldest),
                )))
            }
        }
    }

    /// Replaces the value at the cursor, promoting to writer.
    pub fn set_value(&mut self, value: &[u8]) -> KvResult<()> {
        if self.key_index < 0 {
            return Err(KvError::InvalidCursor);
        }
        let index_backup = self.key_index;
        self.make_writable()?;
        if self.key_index != index_backup {
            // promotion replaced the root, re-descend by index
            self.key_index = index_backup;
            if !self
                .root
                .as_root()?
                .fill_stack_by_index(&mut self.stack, index_backup as u64)
            {
                return Err(KvError::corruption("cursor index out of range"));
            }
        }
        let whole_key = current_key(&self.stack).ok_or(KvError::InvalidCursor)?;
        let coords =
            self.db
                .write_create_or_update_command(Bytes::new(), whole_key, Bytes::copy_from_slice(value))?;
        if self
            .root
            .as_root_mut()?
            .set_value_at_index(index_backup as u64, coords)
            .is_none()
        {
            return Err(KvError::corruption("no value slot at valid cursor index"));
        }
        self.root
            .as_root()?
            .fill_stack_by_index(&mut self.stack, index_backup as u64);
        Ok(())
    }

    /// Erases the key at the cursor, promoting to writer. Invalidates
    /// the cursor.
    pub fn erase_current(&mut self) -> KvResult<()> {
        if self.key_index < 0 {
            return Err(KvError::InvalidCursor);
        }
        let index = self.key_index;
        self.make_writable()?;
        self.key_index = index;
        self.prefix_key_count -= 1;
        if !self
            .root
            .as_root()?
            .fill_stack_by_index(&mut self.stack, index as u64)
        {
            return Err(KvError::corruption("cursor index out of range"));
        }
        let whole_key = current_key(&self.stack).ok_or(KvError::InvalidCursor)?;
        self.db.write_erase_one_command(whole_key)?;
        self.root
            .as_root_mut()?
            .erase_range(index as u64, index as u64);
        self.invalidate_current_key();
        Ok(())
    }

    /// Erases the inclusive prefix-relative index range `[first, last]`,
    /// clamped to the keys within the prefix. Promotes to writer and
    /// invalidates the cursor.
    pub fn erase_range(&mut self, first: i64, last: i64) -> KvResult<()> {
        let first = first.max(0);
        let count = self.get_key_value_count()? as i64;
        let last = last.min(count - 1);
        if last < first {
            return Ok(());
        }
        self.make_writable()?;
        let start = self.prefix_key_start.max(0);
        let abs_first = (first + start) as u64;
        let abs_last = (last + start) as u64;
        self.invalidate_current_key();
        self.prefix_key_count -= last - first + 1;

        if !self
            .root
            .as_root()?
            .fill_stack_by_index(&mut self.stack, abs_first)
        {
            return Err(KvError::corruption("erase start index out of range"));
        }
        let first_key = current_key(&self.stack).ok_or(KvError::InvalidCursor)?;
        if abs_first == abs_last {
            self.db.write_erase_one_command(first_key)?;
        } else {
            if !self
                .root
                .as_root()?
                .fill_stack_by_index(&mut self.stack, abs_last)
            {
                return Err(KvError::corruption("erase end index out of range"));
            }
            let last_key = current_key(&self.stack).ok_or(KvError::InvalidCursor)?;
            self.db.write_erase_range_command(first_key, last_key)?;
        }
        self.root.as_root_mut()?.erase_range(abs_first, abs_last);
        self.invalidate_current_key();
        Ok(())
    }

    /// Erases every key within the prefix.
    pub fn erase_all(&mut self) -> KvResult<()> {
        self.erase_range(0, i64::MAX)
    }

    /// Number of keys within the prefix; cached until the prefix
    /// changes. The empty prefix counts the whole tree.
    pub fn get_key_value_count(&mut self) -> KvResult<u64> {
        if self.prefix_key_count >= 0 {
            return Ok(self.prefix_key_count as u64);
        }
        if self.prefix.is_empty() {
            let count = self.root.as_root()?.calc_key_count();
            self.prefix_key_start = 0;
            self.prefix_key_count = count as i64;
            return Ok(count);
        }
        let start = self.calc_prefix_key_start()?;
        if start < 0 {
            self.prefix_key_count = 0;
            return Ok(0);
        }
        let last = self.root.as_root()?.find_last_with_prefix(&self.prefix);
        self.prefix_key_count = match last {
            Some(last) => (last as i64) - start + 1,
            None => 0,
        };
        Ok(self.prefix_key_count as u64)
    }

    /// Cursor position relative to the prefix start, -1 when invalid.
    pub fn get_key_index(&mut self) -> KvResult<i64> {
        if self.key_index < 0 {
            return Ok(-1);
        }
        let start = self.calc_prefix_key_start()?;
        Ok(self.key_index - start.max(0))
    }

    /// Positions the cursor at prefix-relative index `index`; `false`
    /// and an invalid cursor when out of range.
    pub fn set_key_index(&mut self, index: i64) -> KvResult<bool> {
        if index < 0 {
            self.invalidate_current_key();
            return Ok(false);
        }
        let start = if self.prefix.is_empty() {
            0
        } else {
            self.calc_prefix_key_start()?
        };
        if start < 0 {
            self.invalidate_current_key();
            return Ok(false);
        }
        let key_index = index + start;
        if !self
            .root
            .as_root()?
            .fill_stack_by_index(&mut self.stack, key_index as u64)
        {
            self.invalidate_current_key();
            return Ok(false);
        }
        self.key_index = key_index;
        if self.prefix_key_count >= 0 {
            if index < self.prefix_key_count {
                return Ok(true);
            }
            self.invalidate_current_key();
            return Ok(false);
        }
        let in_prefix =
            current_key(&self.stack).is_some_and(|found| key::starts_with(&found, &self.prefix));
        if in_prefix {
            Ok(true)
        } else {
            self.invalidate_current_key();
            Ok(false)
        }
    }

    /// The 64-bit user value swapped atomically at commit.
    #[must_use]
    pub fn get_commit_ulong(&self) -> u64 {
        self.root.as_root().map_or(0, RootNode::commit_ulong)
    }

    /// Sets the commit ulong, promoting to writer when the value differs.
    pub fn set_commit_ulong(&mut self, value: u64) -> KvResult<()> {
        if self.get_commit_ulong() != value {
            self.make_writable()?;
            self.root.as_root_mut()?.set_commit_ulong(value);
        }
        Ok(())
    }

    /// The user-addressable 64-bit slot at `idx`, 0 when unset.
    #[must_use]
    pub fn get_ulong(&self, idx: u32) -> u64 {
        self.root.as_root().map_or(0, |root| root.get_ulong(idx))
    }

    /// Sets a ulong slot, promoting to writer when the value differs.
    pub fn set_ulong(&mut self, idx: u32, value: u64) -> KvResult<()> {
        if self.get_ulong(idx) != value {
            self.make_writable()?;
            self.root.as_root_mut()?.set_ulong(idx, value);
        }
        Ok(())
    }

    /// Number of allocated ulong slots.
    #[must_use]
    pub fn get_ulong_count(&self) -> u32 {
        self.root.as_root().map_or(0, RootNode::ulong_count)
    }

    /// Transaction id of the current root.
    #[must_use]
    pub fn get_transaction_number(&self) -> u64 {
        self.root.as_root().map_or(0, RootNode::transaction_id)
    }

    /// Asks for a fresh log segment after this transaction's commit.
    pub fn next_commit_temporarily_close_transaction_log(&mut self) -> KvResult<()> {
        self.make_writable()?;
        self.temporary_close_log = true;
        Ok(())
    }

    /// Whether the transaction holds the writer slot.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.writing || self.preapproved_writing
    }

    /// Whether the transaction was started read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the cursor points at a key.
    #[must_use]
    pub fn is_valid_key(&self) -> bool {
        self.key_index >= 0
    }

    /// Byte sizes `(key, value)` of the entry at the cursor; the key
    /// size includes the prefix.
    pub fn get_storage_size_of_current_key(&self) -> KvResult<(u32, u32)> {
        if self.key_index < 0 {
            return Err(KvError::InvalidCursor);
        }
        let whole_key = current_key(&self.stack).ok_or(KvError::InvalidCursor)?;
        let coords = current_value(&self.stack).ok_or(KvError::InvalidCursor)?;
        Ok((whole_key.len() as u32, KeyValueDb::calc_value_size(coords)))
    }

    /// Labels this transaction in leak reports.
    pub fn set_description_for_leaks(&mut self, description: impl Into<String>) {
        let description = description.into();
        if let Ok(root) = self.root.as_root_mut() {
            root.set_description_for_leaks(Some(description.clone()));
        }
        self.description_for_leaks = Some(description);
    }

    /// Finalizes the transaction.
    ///
    /// A writing transaction publishes its root through the commit path;
    /// a preapproved writer that never mutated releases the writer slot
    /// without publishing; a reading transaction just closes. The
    /// transaction is unusable afterwards.
    pub fn commit(&mut self) -> KvResult<()> {
        let root = std::mem::replace(&mut self.root, RootHandle::Closed);
        if matches!(root, RootHandle::Closed) {
            return Err(KvError::TransactionClosed);
        }
        self.invalidate_current_key();
        if self.preapproved_writing {
            self.preapproved_writing = false;
            if let RootHandle::Writer(writable) = &root {
                self.db.revert_writing_transaction(writable.transaction_id());
            }
            self.writer_guard = None;
            return Ok(());
        }
        if self.writing {
            self.writing = false;
            let RootHandle::Writer(writable) = root else {
                return Err(KvError::corruption("writing transaction lost its root"));
            };
            let result = self
                .db
                .commit_writing_transaction(*writable, self.temporary_close_log);
            self.temporary_close_log = false;
            self.writer_guard = None;
            return result;
        }
        Ok(())
    }

    /// Takes the writer slot for this transaction.
    ///
    /// Preapproved writers only open the log transaction. A lazy
    /// promotion waits for the writer gate, re-checks that no other
    /// transaction committed since this snapshot was taken, and starts
    /// over a fresh clone of the committed root. A stale snapshot fails
    /// with a retriable error.
    fn make_writable(&mut self) -> KvResult<()> {
        if self.writing {
            return Ok(());
        }
        if self.preapproved_writing {
            self.preapproved_writing = false;
            self.writing = true;
            let transaction_id = self.root.as_root()?.transaction_id();
            self.db.write_start_transaction(transaction_id)?;
            return Ok(());
        }
        if self.read_only {
            return Err(KvError::transaction_retry(
                "transaction is read-only, start a writable transaction instead",
            ));
        }
        let old = match &self.root {
            RootHandle::Reader(root) => Arc::clone(root),
            RootHandle::Writer(_) => {
                return Err(KvError::corruption("writable root without writer slot"))
            }
            RootHandle::Closed => return Err(KvError::TransactionClosed),
        };
        let guard = self.db.lock_writer();
        let mut writable = self.db.make_writable_root(&old)?;
        writable.set_description_for_leaks(self.description_for_leaks.clone());
        let transaction_id = writable.transaction_id();
        self.root = RootHandle::Writer(Box::new(writable));
        self.writer_guard = Some(guard);
        self.writing = true;
        self.invalidate_current_key();
        self.db.write_start_transaction(transaction_id)?;
        Ok(())
    }

    fn calc_prefix_key_start(&mut self) -> KvResult<i64> {
        if self.prefix_key_start >= 0 {
            return Ok(self.prefix_key_start);
        }
        let mut scratch = CursorStack::new();
        let (result, index) = self
            .root
            .as_root()?
            .find_key(&mut scratch, &self.prefix, b"");
        self.prefix_key_start = match result {
            FindResult::Exact | FindResult::Next => index,
            _ => -1,
        };
        Ok(self.prefix_key_start)
    }

    fn invalidate_current_key(&mut self) {
        self.key_index = -1;
        self.stack.clear();
    }
}

impl Drop for KvTransaction<'_> {
    fn drop(&mut self) {
        if self.writing || self.preapproved_writing {
            if let Ok(root) = self.root.as_root() {
                warn!(
                    transaction_id = root.transaction_id(),
                    description = self.description_for_leaks.as_deref().unwrap_or(""),
                    "transaction dropped without commit, reverting"
                );
                self.db.revert_writing_transaction(root.transaction_id());
            }
        }
        self.root = RootHandle::Closed;
        self.writer_guard = None;
        self.stack.clear();
    }
}

impl std::fmt::Debug for KvTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvTransaction")
            .field("transaction_number", &self.get_transaction_number())
            .field("writing", &self.is_writing())
            .field("read_only", &self.read_only)
            .field("key_index", &self.key_index)
            .finish_non_exhaustive()
    }
}

fn describe_root(root: &RootNode) -> String {
    format!(
        "{{transaction_id: {}, trlog: {}:{}, commit_ulong: {}}}",
        root.transaction_id(),
        root.trlog_file_id(),
        root.trlog_offset(),
        root.commit_ulong()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn memory_db() -> KeyValueDb {
        KeyValueDb::open_in_memory().unwrap()
    }

    #[test]
    fn empty_database_finds_nothing() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        assert_eq!(tr.find(&[0x01, 0x02]).unwrap(), FindResult::NotFound);
        assert!(!tr.find_first_key().unwrap());
        assert!(!tr.is_valid_key());
        assert_eq!(tr.get_key_value_count().unwrap(), 0);
    }

    #[test]
    fn insert_and_read_back() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        assert!(tr.create_or_update(&[0xAA], &[0x10]).unwrap());
        assert_eq!(tr.find(&[0xAA]).unwrap(), FindResult::Exact);
        assert_eq!(tr.get_value().unwrap(), vec![0x10]);
        assert_eq!(tr.get_key_value_count().unwrap(), 1);
    }

    #[test]
    fn update_preserves_count() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        assert!(tr.create_or_update(&[0xAA], &[0x10]).unwrap());
        assert!(!tr.create_or_update(&[0xAA], &[0x20]).unwrap());
        assert_eq!(tr.get_value().unwrap(), vec![0x20]);
        assert_eq!(tr.get_key_value_count().unwrap(), 1);
    }

    #[test]
    fn prefix_scan_visits_only_prefix_members() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        assert!(tr.create_or_update(&[0x01, 0x00], &[1]).unwrap());
        assert!(tr.create_or_update(&[0x01, 0x01], &[2]).unwrap());
        assert!(tr.create_or_update(&[0x02, 0x00], &[3]).unwrap());

        tr.set_key_prefix(&[0x01]);
        assert!(tr.find_first_key().unwrap());
        assert_eq!(tr.get_key().as_ref(), &[0x00]);
        assert!(tr.find_next_key().unwrap());
        assert_eq!(tr.get_key().as_ref(), &[0x01]);
        assert!(!tr.find_next_key().unwrap());
        assert!(!tr.is_valid_key());
        assert_eq!(tr.get_key_value_count().unwrap(), 2);
    }

    #[test]
    fn erase_range_removes_exactly_the_range() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        for i in 0..10u8 {
            assert!(tr.create_or_update(&[i], &[i]).unwrap());
        }
        tr.erase_range(2, 5).unwrap();
        assert_eq!(tr.get_key_value_count().unwrap(), 6);
        let mut keys = Vec::new();
        let mut more = tr.find_first_key().unwrap();
        while more {
            keys.push(tr.get_key().to_vec());
            more = tr.find_next_key().unwrap();
        }
        let expected: Vec<Vec<u8>> = [0u8, 1, 6, 7, 8, 9].iter().map(|i| vec![*i]).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn snapshot_isolation_across_commit() {
        let db = memory_db();
        let mut setup = db.start_transaction();
        setup.create_or_update(&[0xAA], &[0x10]).unwrap();
        setup.commit().unwrap();

        let mut reader = db.start_transaction();
        let mut writer = db.start_transaction();
        writer.create_or_update(&[0xAA], &[0x20]).unwrap();
        writer.create_or_update(&[0xBB], &[0x30]).unwrap();
        writer.commit().unwrap();

        assert!(reader.find_exact_key(&[0xAA]).unwrap());
        assert_eq!(reader.get_value().unwrap(), vec![0x10]);
        assert_eq!(reader.find(&[0xBB]).unwrap(), FindResult::Previous);

        let mut fresh = db.start_transaction();
        assert!(fresh.find_exact_key(&[0xAA]).unwrap());
        assert_eq!(fresh.get_value().unwrap(), vec![0x20]);
        assert!(fresh.find_exact_key(&[0xBB]).unwrap());
        assert_eq!(fresh.get_value().unwrap(), vec![0x30]);
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let db = memory_db();
        let mut setup = db.start_transaction();
        setup.create_or_update(&[1], &[1]).unwrap();
        setup.commit().unwrap();

        let mut tr = db.start_read_only_transaction();
        let result = tr.create_or_update(&[2], &[2]);
        assert!(matches!(result, Err(KvError::TransactionRetry { .. })));
        // tree and log untouched
        assert_eq!(tr.get_key_value_count().unwrap(), 1);
        let mut fresh = db.start_transaction();
        assert_eq!(fresh.get_key_value_count().unwrap(), 1);
    }

    #[test]
    fn stale_snapshot_promotion_is_retriable() {
        let db = memory_db();
        let mut setup = db.start_transaction();
        setup.create_or_update(&[1], &[1]).unwrap();
        setup.commit().unwrap();

        let mut stale = db.start_transaction();
        let mut winner = db.start_transaction();
        winner.create_or_update(&[2], &[2]).unwrap();
        winner.commit().unwrap();

        let result = stale.create_or_update(&[3], &[3]);
        assert!(matches!(result, Err(KvError::TransactionRetry { .. })));
        // the stale transaction stays usable for reads
        assert!(stale.find_exact_key(&[1]).unwrap());
    }

    #[test]
    fn preapproved_writer_commits_without_promotion_error() {
        let db = memory_db();
        let mut tr = db.start_writing_transaction().unwrap();
        assert!(tr.is_writing());
        tr.create_or_update(&[1], &[1]).unwrap();
        tr.commit().unwrap();
        assert_eq!(db.last_transaction_id(), 1);
    }

    #[test]
    fn unused_preapproved_writer_reverts() {
        let db = memory_db();
        let mut tr = db.start_writing_transaction().unwrap();
        tr.commit().unwrap();
        assert_eq!(db.last_transaction_id(), 0);
        // the writer slot is free again
        let mut tr2 = db.start_writing_transaction().unwrap();
        tr2.create_or_update(&[1], &[1]).unwrap();
        tr2.commit().unwrap();
        assert_eq!(db.last_transaction_id(), 1);
    }

    #[test]
    fn second_writer_blocks_until_first_commits() {
        let db = memory_db();
        let mut first = db.start_writing_transaction().unwrap();
        first.create_or_update(&[1], &[1]).unwrap();

        let (started_send, started_recv) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            let db = &db;
            let second = scope.spawn(move || {
                started_send.send(()).unwrap();
                let mut tr = db.start_writing_transaction().unwrap();
                tr.create_or_update(&[2], &[2]).unwrap();
                tr.commit().unwrap();
            });
            started_recv.recv().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            // still parked on the writer gate
            assert!(!second.is_finished());
            first.commit().unwrap();
            second.join().unwrap();
        });

        assert_eq!(db.last_transaction_id(), 2);
        let mut tr = db.start_transaction();
        assert_eq!(tr.get_key_value_count().unwrap(), 2);
        assert!(tr.find_exact_key(&[1]).unwrap());
        assert!(tr.find_exact_key(&[2]).unwrap());
    }

    #[test]
    fn readers_scan_stable_snapshots_while_writer_commits() {
        let db = memory_db();
        let mut setup = db.start_transaction();
        for i in 0..100u32 {
            setup.create_or_update(&i.to_be_bytes(), &[0]).unwrap();
        }
        setup.commit().unwrap();

        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut tr = db.start_transaction();
                let snapshot = tr.get_transaction_number();
                for _ in 0..20 {
                    tr.set_key_prefix(&[]);
                    assert_eq!(tr.get_key_value_count().unwrap(), 100);
                    let mut values = Vec::new();
                    let mut more = tr.find_first_key().unwrap();
                    while more {
                        values.push(tr.get_value().unwrap());
                        more = tr.find_next_key().unwrap();
                    }
                    assert_eq!(values.len(), 100);
                    // one snapshot always shows one uniform round
                    assert!(values.windows(2).all(|pair| pair[0] == pair[1]));
                    assert_eq!(tr.get_transaction_number(), snapshot);
                }
            });
            let writer = scope.spawn(|| {
                for round in 1..=20u8 {
                    let mut tr = db.start_writing_transaction().unwrap();
                    for i in 0..100u32 {
                        tr.create_or_update(&i.to_be_bytes(), &[round]).unwrap();
                    }
                    tr.commit().unwrap();
                }
            });
            reader.join().unwrap();
            writer.join().unwrap();
        });

        let mut tr = db.start_transaction();
        assert!(tr.find_exact_key(&0u32.to_be_bytes()).unwrap());
        assert_eq!(tr.get_value().unwrap(), vec![20]);
    }

    #[test]
    fn commit_twice_is_an_error() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        tr.create_or_update(&[1], &[1]).unwrap();
        tr.commit().unwrap();
        assert!(matches!(tr.commit(), Err(KvError::TransactionClosed)));
        assert!(matches!(tr.find(&[1]), Err(KvError::TransactionClosed)));
    }

    #[test]
    fn key_index_round_trip() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        for i in 0..100u32 {
            tr.create_or_update(&i.to_be_bytes(), &[0]).unwrap();
        }
        for i in [0i64, 1, 42, 99] {
            assert!(tr.set_key_index(i).unwrap());
            assert_eq!(tr.get_key_index().unwrap(), i);
            assert_eq!(tr.get_key().as_ref(), (i as u32).to_be_bytes());
        }
        assert!(!tr.set_key_index(100).unwrap());
        assert!(!tr.is_valid_key());
        assert_eq!(tr.get_key_index().unwrap(), -1);
    }

    #[test]
    fn key_index_is_prefix_relative() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        tr.create_or_update(&[0x01, 0x00], &[1]).unwrap();
        tr.create_or_update(&[0x02, 0x00], &[2]).unwrap();
        tr.create_or_update(&[0x02, 0x01], &[3]).unwrap();

        tr.set_key_prefix(&[0x02]);
        assert!(tr.set_key_index(1).unwrap());
        assert_eq!(tr.get_key().as_ref(), &[0x01]);
        assert_eq!(tr.get_key_index().unwrap(), 1);
        assert!(!tr.set_key_index(2).unwrap());
    }

    #[test]
    fn find_previous_walks_backwards() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        for i in 0..5u8 {
            tr.create_or_update(&[i], &[i]).unwrap();
        }
        assert!(tr.find_last_key().unwrap());
        let mut keys = Vec::new();
        loop {
            keys.push(tr.get_key().to_vec());
            if !tr.find_previous_key().unwrap() {
                break;
            }
        }
        assert_eq!(keys, vec![vec![4], vec![3], vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn erase_current_invalidates_cursor() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        for i in 0..3u8 {
            tr.create_or_update(&[i], &[i]).unwrap();
        }
        assert!(tr.find_exact_key(&[1]).unwrap());
        tr.erase_current().unwrap();
        assert!(!tr.is_valid_key());
        assert!(matches!(tr.erase_current(), Err(KvError::InvalidCursor)));
        assert_eq!(tr.get_key_value_count().unwrap(), 2);
        assert!(!tr.find_exact_key(&[1]).unwrap());
    }

    #[test]
    fn erase_all_respects_prefix() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        tr.create_or_update(&[0x01, 0x00], &[1]).unwrap();
        tr.create_or_update(&[0x01, 0x01], &[2]).unwrap();
        tr.create_or_update(&[0x02, 0x00], &[3]).unwrap();

        tr.set_key_prefix(&[0x01]);
        tr.erase_all().unwrap();
        assert_eq!(tr.get_key_value_count().unwrap(), 0);
        tr.set_key_prefix(&[]);
        assert_eq!(tr.get_key_value_count().unwrap(), 1);
        assert!(tr.find_exact_key(&[0x02, 0x00]).unwrap());
    }

    #[test]
    fn set_value_replaces_in_place() {
        let db = memory_db();
        let mut setup = db.start_transaction();
        setup.create_or_update(&[0xAA], &[1]).unwrap();
        setup.commit().unwrap();

        // reader promotes mid-operation inside set_value
        let mut tr = db.start_transaction();
        assert!(tr.find_exact_key(&[0xAA]).unwrap());
        tr.set_value(&[9, 9, 9]).unwrap();
        assert_eq!(tr.get_value().unwrap(), vec![9, 9, 9]);
        assert_eq!(tr.get_key_value_count().unwrap(), 1);
        tr.commit().unwrap();

        let mut fresh = db.start_transaction();
        assert!(fresh.find_exact_key(&[0xAA]).unwrap());
        assert_eq!(fresh.get_value().unwrap(), vec![9, 9, 9]);
    }

    #[test]
    fn commit_ulong_and_slots_round_trip() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        assert_eq!(tr.get_commit_ulong(), 0);
        tr.set_commit_ulong(1234).unwrap();
        tr.set_ulong(2, 77).unwrap();
        tr.commit().unwrap();

        let tr2 = db.start_transaction();
        assert_eq!(tr2.get_commit_ulong(), 1234);
        assert_eq!(tr2.get_ulong(2), 77);
        assert_eq!(tr2.get_ulong(0), 0);
        assert_eq!(tr2.get_ulong_count(), 3);
    }

    #[test]
    fn setting_equal_ulong_does_not_promote() {
        let db = memory_db();
        let mut tr = db.start_read_only_transaction();
        // equal values never promote, so a read-only transaction accepts them
        tr.set_commit_ulong(0).unwrap();
        tr.set_ulong(5, 0).unwrap();
        assert!(!tr.is_writing());
    }

    #[test]
    fn storage_size_of_current_key() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        tr.create_or_update(&[1, 2, 3], &[9; 10]).unwrap();
        assert!(tr.find_exact_key(&[1, 2, 3]).unwrap());
        assert_eq!(tr.get_storage_size_of_current_key().unwrap(), (3, 10));

        tr.set_key_prefix(&[1]);
        assert!(tr.find_first_key().unwrap());
        // key size includes the prefix
        assert_eq!(tr.get_storage_size_of_current_key().unwrap(), (3, 10));
    }

    #[test]
    fn find_scoped_by_prefix() {
        let db = memory_db();
        let mut tr = db.start_transaction();
        tr.create_or_update(&[0x01, 0x05], &[1]).unwrap();
        tr.create_or_update(&[0x03, 0x05], &[3]).unwrap();

        tr.set_key_prefix(&[0x02]);
        // neighbors exist in the tree but not within the prefix
        assert_eq!(tr.find(&[0x05]).unwrap(), FindResult::NotFound);
        tr.set_key_prefix(&[0x03]);
        assert_eq!(tr.find(&[0x00]).unwrap(), FindResult::Next);
        assert_eq!(tr.get_key().as_ref(), &[0x05]);
    }

    proptest! {
        #[test]
        fn ordered_scan_is_sorted_and_complete(
            keys in proptest::collection::btree_set(
                proptest::collection::vec(any::<u8>(), 1..6), 1..50)
        ) {
            let db = memory_db();
            let mut tr = db.start_transaction();
            for key in &keys {
                prop_assert!(tr.create_or_update(key, &[0]).unwrap());
            }
            let mut scanned = Vec::new();
            let mut more = tr.find_first_key().unwrap();
            while more {
                scanned.push(tr.get_key().to_vec());
                more = tr.find_next_key().unwrap();
            }
            let expected: Vec<Vec<u8>> = keys.iter().cloned().collect();
            prop_assert_eq!(scanned, expected);
        }

        #[test]
        fn prefix_count_matches_reality(
            keys in proptest::collection::btree_set(
                proptest::collection::vec(0u8..4, 2..5), 1..60),
            prefix in proptest::collection::vec(0u8..4, 0..3)
        ) {
            let db = memory_db();
            let mut tr = db.start_transaction();
            for key in &keys {
                tr.create_or_update(key, &[0]).unwrap();
            }
            tr.set_key_prefix(&prefix);
            let expected = keys.iter().filter(|k| k.starts_with(&prefix)).count() as u64;
            prop_assert_eq!(tr.get_key_value_count().unwrap(), expected);
        }
    }
}
