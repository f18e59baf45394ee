//! # CowKV Core
//!
//! Transactional core of CowKV, an embedded ordered key-value store.
//!
//! This crate provides:
//! - A copy-on-write B+-tree index over byte-string keys
//! - Multi-version snapshot reads without locks
//! - A single-writer transaction discipline with lazy writer promotion
//! - An append-only transaction log that doubles as the value heap
//! - Crash recovery by replaying the transaction log
//!
//! The entry point is [`KeyValueDb`]; all reads and writes go through
//! [`KvTransaction`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod btree;
mod config;
mod database;
mod error;
mod key;
mod transaction;
mod wal;

pub use btree::{
    BTreeNode, CreateOrUpdateCtx, CursorStack, FindResult, NodeIdxPair, RootNode, ValueCoords,
    MAX_MEMBERS,
};
pub use config::Config;
pub use database::KeyValueDb;
pub use error::{KvError, KvResult};
pub use transaction::KvTransaction;
pub use wal::{TrLogRecord, TrLogRecordType};
