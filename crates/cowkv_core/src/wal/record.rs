//! Transaction log record types and serialization.

use crate::error::{KvError, KvResult};
use bytes::Bytes;

/// Magic bytes identifying a transaction log record.
pub const TRLOG_MAGIC: [u8; 4] = *b"CKVL";

/// Current transaction log format version.
pub const TRLOG_VERSION: u16 = 1;

/// Type of transaction log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrLogRecordType {
    /// Begin a writing transaction.
    StartTransaction = 1,
    /// Insert or update a key, carrying the value bytes inline.
    CreateOrUpdate = 2,
    /// Erase a single key.
    EraseOne = 3,
    /// Erase an inclusive key range.
    EraseRange = 4,
    /// Commit the open transaction.
    CommitTransaction = 5,
}

impl TrLogRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::StartTransaction),
            2 => Some(Self::CreateOrUpdate),
            3 => Some(Self::EraseOne),
            4 => Some(Self::EraseRange),
            5 => Some(Self::CommitTransaction),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A transaction log record describing one logical mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrLogRecord {
    /// Begin a writing transaction.
    StartTransaction {
        /// Transaction id assigned to the writer.
        transaction_id: u64,
    },

    /// Insert or update a key, carrying the value bytes inline.
    ///
    /// The value bytes written inside this record are the durable value
    /// storage; committed roots point back into the log at them.
    CreateOrUpdate {
        /// Prefix active when the write happened.
        key_prefix: Bytes,
        /// Key relative to the prefix.
        key: Bytes,
        /// Value payload.
        value: Bytes,
    },

    /// Erase a single key (full key, prefix already applied).
    EraseOne {
        /// Key to erase.
        key: Bytes,
    },

    /// Erase all keys in the inclusive range `[first_key, last_key]`.
    EraseRange {
        /// First key of the range.
        first_key: Bytes,
        /// Last key of the range.
        last_key: Bytes,
    },

    /// Commit the open transaction.
    CommitTransaction {
        /// Transaction id being committed.
        transaction_id: u64,
        /// Whether the writer asked for a fresh log segment after commit.
        temporarily_close_log: bool,
        /// Value of the commit ulong at commit time.
        commit_ulong: u64,
        /// Snapshot of the ulong slots, if any were ever set.
        ulongs: Option<Vec<u64>>,
    },
}

impl TrLogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> TrLogRecordType {
        match self {
            Self::StartTransaction { .. } => TrLogRecordType::StartTransaction,
            Self::CreateOrUpdate { .. } => TrLogRecordType::CreateOrUpdate,
            Self::EraseOne { .. } => TrLogRecordType::EraseOne,
            Self::EraseRange { .. } => TrLogRecordType::EraseRange,
            Self::CommitTransaction { .. } => TrLogRecordType::CommitTransaction,
        }
    }

    /// Byte offset of the value bytes inside a `CreateOrUpdate` payload
    /// with the given prefix and key lengths: the three length fields
    /// followed by the prefix and key bytes.
    ///
    /// The offset is relative to the payload start; callers add the
    /// envelope header size to obtain the position inside the log
    /// segment.
    #[must_use]
    pub const fn create_or_update_value_offset(prefix_len: usize, key_len: usize) -> usize {
        12 + prefix_len + key_len
    }

    /// Byte offset of the value bytes inside a `CreateOrUpdate` payload.
    ///
    /// Returns `None` for other record types.
    #[must_use]
    pub fn value_offset_in_payload(&self) -> Option<usize> {
        match self {
            Self::CreateOrUpdate {
                key_prefix, key, ..
            } => Some(Self::create_or_update_value_offset(key_prefix.len(), key.len())),
            _ => None,
        }
    }

    /// Maximum size for a value in a `CreateOrUpdate` record.
    ///
    /// The log format uses a 4-byte length field; value sizes must also
    /// fit the signed 32-bit size stored in value coordinates.
    pub const MAX_VALUE_SIZE: usize = i32::MAX as usize;

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a key or value exceeds the 32-bit length
    /// fields of the log format.
    pub fn encode_payload(&self) -> KvResult<Vec<u8>> {
        let mut buf = Vec::new();

        let push_len = |buf: &mut Vec<u8>, data: &[u8], what: &str| -> KvResult<()> {
            let len = u32::try_from(data.len()).map_err(|_| {
                KvError::invalid_operation(format!("{what} too large: {} bytes", data.len()))
            })?;
            buf.extend_from_slice(&len.to_le_bytes());
            Ok(())
        };

        match self {
            Self::StartTransaction { transaction_id } => {
                buf.extend_from_slice(&transaction_id.to_le_bytes());
            }

            Self::CreateOrUpdate {
                key_prefix,
                key,
                value,
            } => {
                if value.len() > Self::MAX_VALUE_SIZE {
                    return Err(KvError::invalid_operation(format!(
                        "value too large: {} bytes exceeds maximum of {} bytes",
                        value.len(),
                        Self::MAX_VALUE_SIZE
                    )));
                }
                push_len(&mut buf, key_prefix, "key prefix")?;
                push_len(&mut buf, key, "key")?;
                push_len(&mut buf, value, "value")?;
                buf.extend_from_slice(key_prefix);
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
            }

            Self::EraseOne { key } => {
                push_len(&mut buf, key, "key")?;
                buf.extend_from_slice(key);
            }

            Self::EraseRange {
                first_key,
                last_key,
            } => {
                push_len(&mut buf, first_key, "first key")?;
                push_len(&mut buf, last_key, "last key")?;
                buf.extend_from_slice(first_key);
                buf.extend_from_slice(last_key);
            }

            Self::CommitTransaction {
                transaction_id,
                temporarily_close_log,
                commit_ulong,
                ulongs,
            } => {
                buf.extend_from_slice(&transaction_id.to_le_bytes());
                buf.push(u8::from(*temporarily_close_log));
                buf.extend_from_slice(&commit_ulong.to_le_bytes());
                match ulongs {
                    Some(slots) => {
                        buf.push(1);
                        let count = u32::try_from(slots.len()).map_err(|_| {
                            KvError::invalid_operation("too many ulong slots")
                        })?;
                        buf.extend_from_slice(&count.to_le_bytes());
                        for slot in slots {
                            buf.extend_from_slice(&slot.to_le_bytes());
                        }
                    }
                    None => buf.push(0),
                }
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: TrLogRecordType, payload: &[u8]) -> KvResult<Self> {
        let mut cursor = 0;

        let read_u64 = |cursor: &mut usize| -> KvResult<u64> {
            if *cursor + 8 > payload.len() {
                return Err(KvError::wal_corruption("unexpected end of payload"));
            }
            let bytes: [u8; 8] = payload[*cursor..*cursor + 8]
                .try_into()
                .map_err(|_| KvError::wal_corruption("invalid u64"))?;
            *cursor += 8;
            Ok(u64::from_le_bytes(bytes))
        };

        let read_u32 = |cursor: &mut usize| -> KvResult<u32> {
            if *cursor + 4 > payload.len() {
                return Err(KvError::wal_corruption("unexpected end of payload"));
            }
            let bytes: [u8; 4] = payload[*cursor..*cursor + 4]
                .try_into()
                .map_err(|_| KvError::wal_corruption("invalid u32"))?;
            *cursor += 4;
            Ok(u32::from_le_bytes(bytes))
        };

        let read_byte = |cursor: &mut usize| -> KvResult<u8> {
            if *cursor >= payload.len() {
                return Err(KvError::wal_corruption("unexpected end of payload"));
            }
            let b = payload[*cursor];
            *cursor += 1;
            Ok(b)
        };

        let read_bytes = |cursor: &mut usize, len: usize, what: &str| -> KvResult<Bytes> {
            if *cursor + len > payload.len() {
                return Err(KvError::wal_corruption(format!("unexpected end of {what}")));
            }
            let data = Bytes::copy_from_slice(&payload[*cursor..*cursor + len]);
            *cursor += len;
            Ok(data)
        };

        let check_trailing = |cursor: usize, what: &str| -> KvResult<()> {
            if cursor != payload.len() {
                return Err(KvError::wal_corruption(format!(
                    "trailing bytes in {what} record: expected {} bytes, got {}",
                    cursor,
                    payload.len()
                )));
            }
            Ok(())
        };

        match record_type {
            TrLogRecordType::StartTransaction => {
                let transaction_id = read_u64(&mut cursor)?;
                check_trailing(cursor, "StartTransaction")?;
                Ok(Self::StartTransaction { transaction_id })
            }

            TrLogRecordType::CreateOrUpdate => {
                let prefix_len = read_u32(&mut cursor)? as usize;
                let key_len = read_u32(&mut cursor)? as usize;
                let value_len = read_u32(&mut cursor)? as usize;
                let key_prefix = read_bytes(&mut cursor, prefix_len, "key prefix")?;
                let key = read_bytes(&mut cursor, key_len, "key")?;
                let value = read_bytes(&mut cursor, value_len, "value")?;
                check_trailing(cursor, "CreateOrUpdate")?;
                Ok(Self::CreateOrUpdate {
                    key_prefix,
                    key,
                    value,
                })
            }

            TrLogRecordType::EraseOne => {
                let key_len = read_u32(&mut cursor)? as usize;
                let key = read_bytes(&mut cursor, key_len, "key")?;
                check_trailing(cursor, "EraseOne")?;
                Ok(Self::EraseOne { key })
            }

            TrLogRecordType::EraseRange => {
                let first_len = read_u32(&mut cursor)? as usize;
                let last_len = read_u32(&mut cursor)? as usize;
                let first_key = read_bytes(&mut cursor, first_len, "first key")?;
                let last_key = read_bytes(&mut cursor, last_len, "last key")?;
                check_trailing(cursor, "EraseRange")?;
                Ok(Self::EraseRange {
                    first_key,
                    last_key,
                })
            }

            TrLogRecordType::CommitTransaction => {
                let transaction_id = read_u64(&mut cursor)?;
                let temporarily_close_log = read_byte(&mut cursor)? != 0;
                let commit_ulong = read_u64(&mut cursor)?;
                let ulongs = if read_byte(&mut cursor)? != 0 {
                    let count = read_u32(&mut cursor)? as usize;
                    let mut slots = Vec::with_capacity(count);
                    for _ in 0..count {
                        slots.push(read_u64(&mut cursor)?);
                    }
                    Some(slots)
                } else {
                    None
                };
                check_trailing(cursor, "CommitTransaction")?;
                Ok(Self::CommitTransaction {
                    transaction_id,
                    temporarily_close_log,
                    commit_ulong,
                    ulongs,
                })
            }
        }
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, table built at compile time
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_roundtrip() {
        for t in [
            TrLogRecordType::StartTransaction,
            TrLogRecordType::CreateOrUpdate,
            TrLogRecordType::EraseOne,
            TrLogRecordType::EraseRange,
            TrLogRecordType::CommitTransaction,
        ] {
            assert_eq!(TrLogRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(TrLogRecordType::from_byte(0), None);
        assert_eq!(TrLogRecordType::from_byte(6), None);
    }

    #[test]
    fn start_transaction_roundtrip() {
        let record = TrLogRecord::StartTransaction { transaction_id: 42 };
        let payload = record.encode_payload().unwrap();
        let decoded =
            TrLogRecord::decode_payload(TrLogRecordType::StartTransaction, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn create_or_update_roundtrip() {
        let record = TrLogRecord::CreateOrUpdate {
            key_prefix: Bytes::from_static(&[0x01, 0x02]),
            key: Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
            value: Bytes::from_static(&[0xCA, 0xFE]),
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            TrLogRecord::decode_payload(TrLogRecordType::CreateOrUpdate, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn create_or_update_value_offset() {
        let record = TrLogRecord::CreateOrUpdate {
            key_prefix: Bytes::from_static(&[0x01, 0x02]),
            key: Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
            value: Bytes::from_static(&[0xCA, 0xFE]),
        };
        let payload = record.encode_payload().unwrap();
        let offset = record.value_offset_in_payload().unwrap();
        assert_eq!(&payload[offset..offset + 2], &[0xCA, 0xFE]);
    }

    #[test]
    fn create_or_update_empty_value() {
        let record = TrLogRecord::CreateOrUpdate {
            key_prefix: Bytes::new(),
            key: Bytes::from_static(&[0x00]),
            value: Bytes::new(),
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            TrLogRecord::decode_payload(TrLogRecordType::CreateOrUpdate, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn erase_one_roundtrip() {
        let record = TrLogRecord::EraseOne {
            key: Bytes::from_static(&[1, 2, 3]),
        };
        let payload = record.encode_payload().unwrap();
        let decoded = TrLogRecord::decode_payload(TrLogRecordType::EraseOne, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn erase_range_roundtrip() {
        let record = TrLogRecord::EraseRange {
            first_key: Bytes::from_static(&[1]),
            last_key: Bytes::from_static(&[9, 9]),
        };
        let payload = record.encode_payload().unwrap();
        let decoded = TrLogRecord::decode_payload(TrLogRecordType::EraseRange, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn commit_roundtrip_with_ulongs() {
        let record = TrLogRecord::CommitTransaction {
            transaction_id: 7,
            temporarily_close_log: true,
            commit_ulong: 0xDEAD_BEEF,
            ulongs: Some(vec![1, 0, 3]),
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            TrLogRecord::decode_payload(TrLogRecordType::CommitTransaction, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn commit_roundtrip_without_ulongs() {
        let record = TrLogRecord::CommitTransaction {
            transaction_id: 7,
            temporarily_close_log: false,
            commit_ulong: 0,
            ulongs: None,
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            TrLogRecord::decode_payload(TrLogRecordType::CommitTransaction, &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let record = TrLogRecord::EraseOne {
            key: Bytes::from_static(&[1, 2, 3]),
        };
        let payload = record.encode_payload().unwrap();
        let result = TrLogRecord::decode_payload(TrLogRecordType::EraseOne, &payload[..4]);
        assert!(matches!(result, Err(KvError::WalCorruption { .. })));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let record = TrLogRecord::StartTransaction { transaction_id: 1 };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0xFF);
        let result = TrLogRecord::decode_payload(TrLogRecordType::StartTransaction, &payload);
        assert!(matches!(result, Err(KvError::WalCorruption { .. })));
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }
}
