//! Database coordinator: root publication, writer gate and recovery.

use crate::btree::{CreateOrUpdateCtx, CursorStack, FindResult, RootNode, ValueCoords};
use crate::config::Config;
use crate::error::{KvError, KvResult};
use crate::transaction::KvTransaction;
use crate::wal::{TrLog, TrLogRecord, HEADER_SIZE};
use bytes::Bytes;
use cowkv_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// The main database handle.
///
/// Holds the last committed root, the transaction log and the writer
/// gate. Any number of reading transactions may run concurrently; at
/// most one transaction is writing at a time.
///
/// ```rust,ignore
/// use cowkv_core::KeyValueDb;
///
/// let db = KeyValueDb::open(Path::new("my_database"))?;
/// let mut tr = db.start_transaction();
/// tr.create_or_update(&[1, 2, 3], &[42])?;
/// tr.commit()?;
/// ```
pub struct KeyValueDb {
    config: Config,
    trlog: TrLog,
    last_committed: Mutex<Arc<RootNode>>,
    live_roots: Mutex<Vec<Weak<RootNode>>>,
    writer_gate: Mutex<()>,
}

impl KeyValueDb {
    /// Opens an in-memory database. Nothing survives the handle.
    pub fn open_in_memory() -> KvResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens an in-memory database with custom configuration.
    pub fn open_in_memory_with_config(config: Config) -> KvResult<Self> {
        let trlog = TrLog::new(Box::new(|_| Ok(Box::new(InMemoryBackend::new()))))?;
        Ok(Self::assemble(config, trlog, Arc::new(RootNode::new())))
    }

    /// Opens a database from a directory path, replaying any existing
    /// transaction log segments.
    pub fn open(path: &Path) -> KvResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database from a directory path with custom configuration.
    pub fn open_with_config(path: &Path, config: Config) -> KvResult<Self> {
        std::fs::create_dir_all(path)?;
        let existing = Self::existing_segment_ids(path)?;
        let dir = path.to_path_buf();
        let factory = Box::new(move |id: u32| {
            let backend = FileBackend::open(&Self::segment_path(&dir, id))?;
            Ok(Box::new(backend) as Box<dyn StorageBackend>)
        });
        let trlog = TrLog::from_existing(factory, &existing)?;
        let root = Self::replay(&trlog)?;
        debug!(
            transaction_id = root.transaction_id(),
            key_count = root.calc_key_count(),
            segments = existing.len(),
            "database opened"
        );
        Ok(Self::assemble(config, trlog, Arc::new(root)))
    }

    fn assemble(config: Config, trlog: TrLog, root: Arc<RootNode>) -> Self {
        Self {
            config,
            trlog,
            live_roots: Mutex::new(vec![Arc::downgrade(&root)]),
            last_committed: Mutex::new(root),
            writer_gate: Mutex::new(()),
        }
    }

    fn segment_path(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("trlog.{id:06}.log"))
    }

    fn existing_segment_ids(path: &Path) -> KvResult<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(middle) = name
                .strip_prefix("trlog.")
                .and_then(|rest| rest.strip_suffix(".log"))
            else {
                continue;
            };
            if let Ok(id) = middle.parse::<u32>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Rebuilds the last committed root by replaying all log segments.
    ///
    /// Mutations between a `StartTransaction` and its commit are applied
    /// to a staging root that becomes visible only when the commit
    /// record is reached; an unfinished tail is discarded.
    ///
    /// Each segment is cut back to the end of its last complete record,
    /// so appends after recovery never land behind bytes replay could
    /// not parse.
    fn replay(trlog: &TrLog) -> KvResult<RootNode> {
        let mut last = RootNode::new();
        let mut staging: Option<RootNode> = None;
        let mut scratch = CursorStack::new();

        'segments: for segment_id in trlog.segment_ids() {
            let mut records = trlog.iter_segment(segment_id)?;
            loop {
                let (record_offset, record) = match records.next() {
                    Some(Ok(item)) => item,
                    Some(Err(e)) => {
                        // usable log ends here
                        warn!(segment_id, error = %e, "log replay stopped at damaged record");
                        trlog.truncate_segment(segment_id, records.offset())?;
                        break 'segments;
                    }
                    None => {
                        // drop any torn tail left by a crash mid-append
                        trlog.truncate_segment(segment_id, records.offset())?;
                        break;
                    }
                };
                match record {
                    TrLogRecord::StartTransaction { transaction_id } => {
                        staging = Some(last.new_writable(transaction_id));
                    }
                    TrLogRecord::CreateOrUpdate {
                        key_prefix,
                        key,
                        value,
                    } => {
                        let Some(root) = staging.as_mut() else { continue };
                        let in_payload = TrLogRecord::create_or_update_value_offset(
                            key_prefix.len(),
                            key.len(),
                        );
                        let value_offset = record_offset + (HEADER_SIZE + in_payload) as u64;
                        let Ok(offset) = u32::try_from(value_offset) else {
                            break 'segments;
                        };
                        let mut ctx = CreateOrUpdateCtx::new(
                            key_prefix,
                            key,
                            ValueCoords {
                                file_id: segment_id,
                                offset,
                                size: value.len() as i32,
                            },
                        );
                        root.create_or_update(&mut ctx);
                    }
                    TrLogRecord::EraseOne { key } => {
                        let Some(root) = staging.as_mut() else { continue };
                        let (result, index) = root.find_key(&mut scratch, &[], &key);
                        if result == FindResult::Exact {
                            root.erase_range(index as u64, index as u64);
                        }
                    }
                    TrLogRecord::EraseRange {
                        first_key,
                        last_key,
                    } => {
                        let Some(root) = staging.as_mut() else { continue };
                        let (first_result, first) = root.find_key(&mut scratch, &[], &first_key);
                        let first = match first_result {
                            FindResult::Exact | FindResult::Next => first,
                            FindResult::Previous => first + 1,
                            FindResult::NotFound => continue,
                        };
                        let (last_result, last) = root.find_key(&mut scratch, &[], &last_key);
                        let last = match last_result {
                            FindResult::Exact | FindResult::Previous => last,
                            FindResult::Next => last - 1,
                            FindResult::NotFound => continue,
                        };
                        if first <= last && first >= 0 {
                            root.erase_range(first as u64, last as u64);
                        }
                    }
                    TrLogRecord::CommitTransaction {
                        transaction_id,
                        temporarily_close_log: _,
                        commit_ulong,
                        ulongs,
                    } => {
                        let Some(mut root) = staging.take() else { continue };
                        if root.transaction_id() != transaction_id {
                            debug!(
                                segment_id,
                                transaction_id, "commit record does not match open transaction"
                            );
                            continue;
                        }
                        root.set_commit_ulong(commit_ulong);
                        root.set_ulongs(ulongs);
                        let offset = u32::try_from(record_offset).unwrap_or(u32::MAX);
                        root.set_trlog_position(segment_id, offset);
                        last = root;
                    }
                }
            }
        }
        Ok(last)
    }

    /// Starts a reading transaction over the last committed snapshot.
    ///
    /// The transaction promotes itself to writing on its first mutation.
    pub fn start_transaction(&self) -> KvTransaction<'_> {
        KvTransaction::new_reader(self, self.last_committed_root(), false)
    }

    /// Starts a reading transaction that refuses to be promoted.
    pub fn start_read_only_transaction(&self) -> KvTransaction<'_> {
        KvTransaction::new_reader(self, self.last_committed_root(), true)
    }

    /// Starts a transaction that is preapproved for writing.
    ///
    /// Blocks until the writer gate is free, then takes a snapshot.
    /// Unlike lazy promotion this can never fail with a retry error.
    pub fn start_writing_transaction(&self) -> KvResult<KvTransaction<'_>> {
        let guard = self.lock_writer();
        let old = self.last_committed_root();
        let root = old.new_writable(old.transaction_id() + 1);
        Ok(KvTransaction::new_preapproved(self, root, guard))
    }

    /// The last committed root snapshot.
    pub fn last_committed_root(&self) -> Arc<RootNode> {
        Arc::clone(&self.last_committed.lock())
    }

    /// Transaction id of the last commit.
    pub fn last_transaction_id(&self) -> u64 {
        self.last_committed.lock().transaction_id()
    }

    /// The live root with the smallest transaction id.
    ///
    /// This is the snapshot that still pins the oldest log data.
    pub fn oldest_live_root(&self) -> Arc<RootNode> {
        let oldest = {
            let mut roots = self.live_roots.lock();
            roots.retain(|weak| weak.strong_count() > 0);
            roots
                .iter()
                .filter_map(Weak::upgrade)
                .min_by_key(|root| root.transaction_id())
        };
        oldest.unwrap_or_else(|| self.last_committed_root())
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer_gate.lock()
    }

    /// Turns a reader snapshot into a writable root.
    ///
    /// Must be called with the writer gate held. Fails with a retriable
    /// error when another transaction committed after the snapshot was
    /// taken.
    pub(crate) fn make_writable_root(&self, old: &RootNode) -> KvResult<RootNode> {
        let last = self.last_committed.lock();
        if last.transaction_id() != old.transaction_id() {
            return Err(KvError::transaction_retry(format!(
                "snapshot of transaction {} is stale, last committed is {}",
                old.transaction_id(),
                last.transaction_id()
            )));
        }
        Ok(last.new_writable(last.transaction_id() + 1))
    }

    pub(crate) fn write_start_transaction(&self, transaction_id: u64) -> KvResult<()> {
        self.trlog
            .append(&TrLogRecord::StartTransaction { transaction_id })?;
        Ok(())
    }

    pub(crate) fn write_create_or_update_command(
        &self,
        key_prefix: Bytes,
        key: Bytes,
        value: Bytes,
    ) -> KvResult<ValueCoords> {
        self.trlog.append_create_or_update(key_prefix, key, value)
    }

    pub(crate) fn write_erase_one_command(&self, key: Bytes) -> KvResult<()> {
        self.trlog.append(&TrLogRecord::EraseOne { key })?;
        Ok(())
    }

    pub(crate) fn write_erase_range_command(
        &self,
        first_key: Bytes,
        last_key: Bytes,
    ) -> KvResult<()> {
        self.trlog.append(&TrLogRecord::EraseRange {
            first_key,
            last_key,
        })?;
        Ok(())
    }

    /// Publishes a writing transaction's root as the new last committed
    /// root. The commit record is durable before the root is visible.
    pub(crate) fn commit_writing_transaction(
        &self,
        mut root: RootNode,
        temporarily_close_log: bool,
    ) -> KvResult<()> {
        let pos = self.trlog.append(&TrLogRecord::CommitTransaction {
            transaction_id: root.transaction_id(),
            temporarily_close_log,
            commit_ulong: root.commit_ulong(),
            ulongs: root.ulongs().map(<[u64]>::to_vec),
        })?;
        if self.config.sync_on_commit {
            self.trlog.sync()?;
        } else {
            self.trlog.flush()?;
        }

        root.set_trlog_position(pos.file_id, u32::try_from(pos.offset).unwrap_or(u32::MAX));
        let transaction_id = root.transaction_id();
        let published = Arc::new(root);
        {
            let mut last = self.last_committed.lock();
            self.live_roots.lock().push(Arc::downgrade(&published));
            *last = published;
        }
        if temporarily_close_log {
            let new_segment = self.trlog.roll_segment()?;
            debug!(new_segment, "log segment rolled after commit");
        }
        debug!(transaction_id, "transaction committed");
        Ok(())
    }

    /// Forgets a preapproved transaction that never wrote anything.
    pub(crate) fn revert_writing_transaction(&self, transaction_id: u64) {
        debug!(transaction_id, "writing transaction reverted");
    }

    /// Reads the value bytes the coordinates point at.
    pub(crate) fn read_value(&self, coords: ValueCoords) -> KvResult<Vec<u8>> {
        self.trlog.read_value(coords)
    }

    /// Size in bytes of the value the coordinates point at.
    pub(crate) fn calc_value_size(coords: ValueCoords) -> u32 {
        coords.size.unsigned_abs()
    }

    /// Reports snapshots still alive, for diagnosing leaked transactions.
    pub fn report_leaked_roots(&self) {
        let last_id = self.last_transaction_id();
        let mut roots = self.live_roots.lock();
        roots.retain(|weak| weak.strong_count() > 0);
        for root in roots.iter().filter_map(Weak::upgrade) {
            if root.transaction_id() == last_id {
                continue;
            }
            warn!(
                transaction_id = root.transaction_id(),
                description = root.description_for_leaks().unwrap_or("unknown"),
                "old root still referenced"
            );
        }
    }
}

impl std::fmt::Debug for KeyValueDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueDb")
            .field("last_transaction_id", &self.last_transaction_id())
            .field("trlog", &self.trlog)
            .finish_non_exhaustive()
    }
}
