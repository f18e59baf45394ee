//! Key byte-string helpers.
//!
//! Keys are ordered byte strings compared in lexicographic unsigned-byte
//! order. [`bytes::Bytes`] serves as the shared byte-range buffer: a
//! refcounted `(buffer, offset, length)` window with zero-copy slicing.

use bytes::{BufMut, Bytes, BytesMut};

/// Concatenates a prefix and a key into one owned key.
pub fn concat(prefix: &[u8], key: &[u8]) -> Bytes {
    if prefix.is_empty() {
        return Bytes::copy_from_slice(key);
    }
    let mut buf = BytesMut::with_capacity(prefix.len() + key.len());
    buf.put_slice(prefix);
    buf.put_slice(key);
    buf.freeze()
}

/// Returns whether `key` starts with `prefix`.
pub fn starts_with(key: &[u8], prefix: &[u8]) -> bool {
    key.len() >= prefix.len() && &key[..prefix.len()] == prefix
}

/// Returns the smallest byte string greater than every string starting
/// with `prefix`, or `None` when no such bound exists (empty prefix or
/// all bytes `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let mut bytes = prefix.to_vec();
    while let Some(last) = bytes.last_mut() {
        if *last == 0xFF {
            bytes.pop();
        } else {
            *last += 1;
            return Some(Bytes::from(bytes));
        }
    }
    None
}
