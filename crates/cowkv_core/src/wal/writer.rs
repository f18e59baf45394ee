//! Transaction log writer and segment reader.

use crate::btree::ValueCoords;
use crate::error::{KvError, KvResult};
use crate::wal::record::{
    compute_crc32, TrLogRecord, TrLogRecordType, TRLOG_MAGIC, TRLOG_VERSION,
};
use bytes::Bytes;
use cowkv_storage::{StorageBackend, StorageError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Header size for transaction log records.
/// magic (4) + version (2) + type (1) + length (4) = 11 bytes
pub(crate) const HEADER_SIZE: usize = 11;

/// CRC size.
const CRC_SIZE: usize = 4;

/// Opens the backend for a log segment by id.
pub type SegmentFactory =
    Box<dyn Fn(u32) -> Result<Box<dyn StorageBackend>, StorageError> + Send + Sync>;

/// Position of a record inside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePosition {
    /// Segment the record was appended to.
    pub file_id: u32,
    /// Byte offset of the record envelope within the segment.
    pub offset: u64,
}

struct TrLogState {
    segments: BTreeMap<u32, Arc<Mutex<Box<dyn StorageBackend>>>>,
    current_id: u32,
}

/// Append-only, segmented transaction log.
///
/// Records are framed with a magic/version/type/length header and a
/// trailing CRC32. Appends go to the current segment; older segments
/// stay open read-only because committed value coordinates keep pointing
/// into them.
pub struct TrLog {
    factory: SegmentFactory,
    state: Mutex<TrLogState>,
}

impl TrLog {
    /// Creates a log with a single fresh segment 0.
    pub fn new(factory: SegmentFactory) -> KvResult<Self> {
        let backend = (factory)(0)?;
        let mut segments = BTreeMap::new();
        segments.insert(0, Arc::new(Mutex::new(backend)));
        Ok(Self {
            factory,
            state: Mutex::new(TrLogState {
                segments,
                current_id: 0,
            }),
        })
    }

    /// Opens a log over existing segments; appends go to the highest id.
    ///
    /// With no existing segments this behaves like [`TrLog::new`].
    pub fn from_existing(factory: SegmentFactory, ids: &[u32]) -> KvResult<Self> {
        if ids.is_empty() {
            return Self::new(factory);
        }
        let mut segments = BTreeMap::new();
        for &id in ids {
            let backend = (factory)(id)?;
            segments.insert(id, Arc::new(Mutex::new(backend)));
        }
        // ids is non-empty here
        let current_id = segments.keys().copied().max().unwrap_or(0);
        Ok(Self {
            factory,
            state: Mutex::new(TrLogState {
                segments,
                current_id,
            }),
        })
    }

    /// Appends a record to the current segment.
    ///
    /// Returns the position of the record envelope.
    pub fn append(&self, record: &TrLogRecord) -> KvResult<WritePosition> {
        let payload = record.encode_payload()?;
        let record_type = record.record_type();

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&TRLOG_MAGIC);
        data.extend_from_slice(&TRLOG_VERSION.to_le_bytes());
        data.push(record_type.as_byte());
        let len = u32::try_from(payload.len())
            .map_err(|_| KvError::invalid_operation("record payload too large"))?;
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        let (file_id, backend) = self.current_segment();
        let offset = backend.lock().append(&data)?;
        Ok(WritePosition { file_id, offset })
    }

    /// Appends a `CreateOrUpdate` record and returns coordinates of the
    /// value bytes inside the appended record.
    pub fn append_create_or_update(
        &self,
        key_prefix: Bytes,
        key: Bytes,
        value: Bytes,
    ) -> KvResult<ValueCoords> {
        if value.len() > TrLogRecord::MAX_VALUE_SIZE {
            return Err(KvError::invalid_operation(format!(
                "value too large: {} bytes",
                value.len()
            )));
        }
        let value_len = value.len();
        let record = TrLogRecord::CreateOrUpdate {
            key_prefix: key_prefix.clone(),
            key: key.clone(),
            value,
        };
        let pos = self.append(&record)?;
        let in_payload =
            TrLogRecord::create_or_update_value_offset(key_prefix.len(), key.len());
        let value_offset = pos.offset + (HEADER_SIZE + in_payload) as u64;
        let offset = u32::try_from(value_offset)
            .map_err(|_| KvError::invalid_operation("log segment exceeds 4 GiB"))?;
        Ok(ValueCoords {
            file_id: pos.file_id,
            offset,
            size: value_len as i32,
        })
    }

    /// Flushes buffered writes of the current segment.
    pub fn flush(&self) -> KvResult<()> {
        let (_, backend) = self.current_segment();
        backend.lock().flush()?;
        Ok(())
    }

    /// Flushes and syncs the current segment to durable storage.
    pub fn sync(&self) -> KvResult<()> {
        let (_, backend) = self.current_segment();
        let mut guard = backend.lock();
        guard.flush()?;
        guard.sync()?;
        Ok(())
    }

    /// Starts a fresh segment; subsequent appends go there.
    pub fn roll_segment(&self) -> KvResult<u32> {
        let mut state = self.state.lock();
        let next_id = state.current_id + 1;
        let backend = (self.factory)(next_id)?;
        state.segments.insert(next_id, Arc::new(Mutex::new(backend)));
        state.current_id = next_id;
        Ok(next_id)
    }

    /// Reads the value bytes a committed root points at.
    pub fn read_value(&self, coords: ValueCoords) -> KvResult<Vec<u8>> {
        let len = coords.size.unsigned_abs() as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let backend = {
            let state = self.state.lock();
            state.segments.get(&coords.file_id).cloned()
        };
        let backend = backend.ok_or_else(|| {
            KvError::corruption(format!("log segment {} not found", coords.file_id))
        })?;
        let data = backend.lock().read_at(u64::from(coords.offset), len)?;
        Ok(data)
    }

    /// Ids of all open segments, in ascending order.
    pub fn segment_ids(&self) -> Vec<u32> {
        self.state.lock().segments.keys().copied().collect()
    }

    /// Id of the segment currently receiving appends.
    pub fn current_segment_id(&self) -> u32 {
        self.state.lock().current_id
    }

    /// Cuts a segment back to `offset`, dropping everything after it.
    ///
    /// Used during recovery to remove a tail the record iterator could
    /// not parse, so later appends start right after the last complete
    /// record. Does nothing when the segment is already that short.
    pub fn truncate_segment(&self, file_id: u32, offset: u64) -> KvResult<()> {
        let backend = {
            let state = self.state.lock();
            state.segments.get(&file_id).cloned()
        };
        let backend = backend
            .ok_or_else(|| KvError::corruption(format!("log segment {file_id} not found")))?;
        let mut guard = backend.lock();
        if guard.size()? > offset {
            guard.truncate(offset)?;
        }
        Ok(())
    }

    /// Streaming iterator over the records of one segment.
    ///
    /// A truncated record at the segment tail ends iteration cleanly;
    /// invalid magic, an unsupported version, an unknown record type or
    /// a CRC mismatch yield an error.
    pub fn iter_segment(&self, file_id: u32) -> KvResult<TrLogSegmentIter> {
        let backend = {
            let state = self.state.lock();
            state.segments.get(&file_id).cloned()
        };
        let backend = backend
            .ok_or_else(|| KvError::corruption(format!("log segment {file_id} not found")))?;
        let size = backend.lock().size()?;
        Ok(TrLogSegmentIter {
            backend,
            offset: 0,
            size,
            finished: false,
        })
    }

    fn current_segment(&self) -> (u32, Arc<Mutex<Box<dyn StorageBackend>>>) {
        let state = self.state.lock();
        let backend = Arc::clone(&state.segments[&state.current_id]);
        (state.current_id, backend)
    }
}

impl std::fmt::Debug for TrLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TrLog")
            .field("current_id", &state.current_id)
            .field("segments", &state.segments.len())
            .finish_non_exhaustive()
    }
}

/// Streaming iterator over one log segment.
pub struct TrLogSegmentIter {
    backend: Arc<Mutex<Box<dyn StorageBackend>>>,
    offset: u64,
    size: u64,
    finished: bool,
}

impl TrLogSegmentIter {
    /// Offset just past the last fully parsed record.
    ///
    /// Only advances across records that decoded and checksummed
    /// cleanly, so after iteration stops this marks where a damaged
    /// tail begins.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> KvResult<Option<(u64, TrLogRecord)>> {
        if self.finished {
            return Ok(None);
        }
        let record_offset = self.offset;
        if record_offset + HEADER_SIZE as u64 > self.size {
            // incomplete header, unfinished tail
            self.finished = true;
            return Ok(None);
        }

        let header = self.backend.lock().read_at(record_offset, HEADER_SIZE)?;
        if header[0..4] != TRLOG_MAGIC {
            self.finished = true;
            return Err(KvError::wal_corruption(format!(
                "invalid magic at offset {record_offset}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > TRLOG_VERSION {
            self.finished = true;
            return Err(KvError::wal_corruption(format!(
                "unsupported version {version} at offset {record_offset}"
            )));
        }
        let type_byte = header[6];
        let Some(record_type) = TrLogRecordType::from_byte(type_byte) else {
            self.finished = true;
            return Err(KvError::wal_corruption(format!(
                "unknown record type {type_byte} at offset {record_offset}"
            )));
        };
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;

        let total = HEADER_SIZE as u64 + payload_len + CRC_SIZE as u64;
        if record_offset + total > self.size {
            // record written but not completed before the crash
            self.finished = true;
            return Ok(None);
        }

        let data = self.backend.lock().read_at(record_offset, total as usize)?;
        let crc_start = data.len() - CRC_SIZE;
        let stored_crc = u32::from_le_bytes([
            data[crc_start],
            data[crc_start + 1],
            data[crc_start + 2],
            data[crc_start + 3],
        ]);
        let computed = compute_crc32(&data[..crc_start]);
        if stored_crc != computed {
            self.finished = true;
            return Err(KvError::wal_corruption(format!(
                "checksum mismatch at offset {record_offset}: stored {stored_crc:#010x}, computed {computed:#010x}"
            )));
        }

        let record = TrLogRecord::decode_payload(record_type, &data[HEADER_SIZE..crc_start])?;
        self.offset = record_offset + total;
        Ok(Some((record_offset, record)))
    }
}

impl Iterator for TrLogSegmentIter {
    type Item = KvResult<(u64, TrLogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowkv_storage::InMemoryBackend;

    fn memory_log() -> TrLog {
        TrLog::new(Box::new(|_| Ok(Box::new(InMemoryBackend::new())))).unwrap()
    }

    fn read_all(log: &TrLog, file_id: u32) -> Vec<(u64, TrLogRecord)> {
        log.iter_segment(file_id)
            .unwrap()
            .collect::<KvResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let log = memory_log();
        let start = TrLogRecord::StartTransaction { transaction_id: 1 };
        let commit = TrLogRecord::CommitTransaction {
            transaction_id: 1,
            temporarily_close_log: false,
            commit_ulong: 5,
            ulongs: None,
        };
        let p1 = log.append(&start).unwrap();
        let p2 = log.append(&commit).unwrap();
        assert_eq!(p1.file_id, 0);
        assert_eq!(p1.offset, 0);
        assert!(p2.offset > p1.offset);

        let records = read_all(&log, 0);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (p1.offset, start));
        assert_eq!(records[1], (p2.offset, commit));
    }

    #[test]
    fn value_coords_point_at_value_bytes() {
        let log = memory_log();
        let coords = log
            .append_create_or_update(
                Bytes::from_static(&[0x01]),
                Bytes::from_static(&[0x02, 0x03]),
                Bytes::from_static(&[0xCA, 0xFE, 0xBA, 0xBE]),
            )
            .unwrap();
        assert_eq!(coords.file_id, 0);
        assert_eq!(coords.size, 4);
        assert_eq!(log.read_value(coords).unwrap(), vec![0xCA, 0xFE, 0xBA, 0xBE]);
    }

    #[test]
    fn empty_value_reads_back_empty() {
        let log = memory_log();
        let coords = log
            .append_create_or_update(Bytes::new(), Bytes::from_static(&[0x01]), Bytes::new())
            .unwrap();
        assert_eq!(coords.size, 0);
        assert!(log.read_value(coords).unwrap().is_empty());
    }

    #[test]
    fn roll_segment_redirects_appends() {
        let log = memory_log();
        log.append(&TrLogRecord::StartTransaction { transaction_id: 1 })
            .unwrap();
        let new_id = log.roll_segment().unwrap();
        assert_eq!(new_id, 1);
        assert_eq!(log.current_segment_id(), 1);
        let pos = log
            .append(&TrLogRecord::StartTransaction { transaction_id: 2 })
            .unwrap();
        assert_eq!(pos.file_id, 1);
        assert_eq!(pos.offset, 0);

        assert_eq!(read_all(&log, 0).len(), 1);
        assert_eq!(read_all(&log, 1).len(), 1);
        assert_eq!(log.segment_ids(), vec![0, 1]);
    }

    #[test]
    fn truncated_tail_ends_iteration() {
        let log = memory_log();
        log.append(&TrLogRecord::StartTransaction { transaction_id: 1 })
            .unwrap();
        let pos = log
            .append(&TrLogRecord::EraseOne {
                key: Bytes::from_static(&[1, 2, 3]),
            })
            .unwrap();
        // chop the second record in half
        let (_, backend) = log.current_segment();
        let cut = pos.offset + HEADER_SIZE as u64 + 2;
        backend.lock().truncate(cut).unwrap();
        drop(backend);

        let records = read_all(&log, 0);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn truncate_segment_drops_damaged_tail() {
        let log = memory_log();
        log.append(&TrLogRecord::StartTransaction { transaction_id: 1 })
            .unwrap();
        let good_end = {
            let mut iter = log.iter_segment(0).unwrap();
            assert!(iter.next().is_some());
            assert!(iter.next().is_none());
            iter.offset()
        };
        let (_, backend) = log.current_segment();
        backend.lock().append(&[0xDE, 0xAD, 0xBE]).unwrap();
        drop(backend);

        log.truncate_segment(0, good_end).unwrap();
        assert_eq!(read_all(&log, 0).len(), 1);
        let (_, backend) = log.current_segment();
        assert_eq!(backend.lock().size().unwrap(), good_end);
    }

    #[test]
    fn corrupted_crc_is_an_error() {
        let log = memory_log();
        log.append(&TrLogRecord::StartTransaction { transaction_id: 1 })
            .unwrap();
        let (_, backend) = log.current_segment();
        let size = backend.lock().size().unwrap();
        // flip a payload byte, leaving the envelope intact
        let mut guard = backend.lock();
        let mut data = guard.read_at(0, size as usize).unwrap();
        data[HEADER_SIZE] ^= 0xFF;
        guard.truncate(0).unwrap();
        guard.append(&data).unwrap();
        drop(guard);
        drop(backend);

        let result: KvResult<Vec<_>> = log.iter_segment(0).unwrap().collect();
        assert!(matches!(result, Err(KvError::WalCorruption { .. })));
    }

    #[test]
    fn from_existing_resumes_highest_segment() {
        // one shared byte store per segment id so reopening sees old data
        use parking_lot::Mutex as PMutex;
        let stores: Arc<PMutex<std::collections::HashMap<u32, Vec<u8>>>> =
            Arc::new(PMutex::new(std::collections::HashMap::new()));
        let make_factory = |stores: Arc<PMutex<std::collections::HashMap<u32, Vec<u8>>>>| -> SegmentFactory {
            Box::new(move |id| {
                let data = stores.lock().get(&id).cloned().unwrap_or_default();
                Ok(Box::new(InMemoryBackend::with_data(data)))
            })
        };

        let log = TrLog::new(make_factory(Arc::clone(&stores))).unwrap();
        log.append(&TrLogRecord::StartTransaction { transaction_id: 1 })
            .unwrap();
        log.roll_segment().unwrap();
        log.append(&TrLogRecord::StartTransaction { transaction_id: 2 })
            .unwrap();
        for id in log.segment_ids() {
            let (_, backend) = {
                let state = log.state.lock();
                (id, Arc::clone(&state.segments[&id]))
            };
            let guard = backend.lock();
            let size = guard.size().unwrap();
            let data = guard.read_at(0, size as usize).unwrap();
            stores.lock().insert(id, data);
        }

        let reopened = TrLog::from_existing(make_factory(stores), &[0, 1]).unwrap();
        assert_eq!(reopened.current_segment_id(), 1);
        assert_eq!(read_all(&reopened, 0).len(), 1);
        assert_eq!(read_all(&reopened, 1).len(), 1);
    }
}
