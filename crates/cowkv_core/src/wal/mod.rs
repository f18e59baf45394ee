//! Segmented transaction log: durability and value storage in one file.
//!
//! Every mutation of a writing transaction is appended to the log before
//! the commit is acknowledged. The log doubles as the value store:
//! `CreateOrUpdate` records carry the value bytes inline, and committed
//! tree leaves point back into the log at those bytes. On open, the log
//! is replayed segment by segment to rebuild the last committed root.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! A record cut short at the end of a segment is an unfinished tail from
//! a crash mid-write; it and everything after it are discarded, which
//! rolls back the transaction whose commit record never made it. Invalid
//! magic, an unsupported version, an unknown record type or a CRC
//! mismatch are genuine corruption and surface as errors.

mod record;
mod writer;

pub use record::{compute_crc32, TrLogRecord, TrLogRecordType, TRLOG_MAGIC, TRLOG_VERSION};
pub use writer::{SegmentFactory, TrLog, TrLogSegmentIter, WritePosition};

pub(crate) use writer::HEADER_SIZE;
