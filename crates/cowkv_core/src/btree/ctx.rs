//! Mutation context for create-or-update.

use crate::btree::node::ValueCoords;
use crate::key;
use bytes::Bytes;

/// Scratch state for a single create-or-update descent.
///
/// Carries the inputs down the tree and collects the outcome on the way
/// back up, so the recursion does not allocate per-frame result wrappers.
#[derive(Debug)]
pub struct CreateOrUpdateCtx {
    /// Key prefix of the transaction issuing the mutation.
    pub key_prefix: Bytes,
    /// Key within the prefix scope.
    pub key: Bytes,
    /// Coordinates under which the value was stored in the log.
    pub value: ValueCoords,

    /// Whether the key was created (`true`) or an existing key was
    /// updated (`false`).
    pub created: bool,
    /// Absolute index of the key after the mutation.
    pub key_index: u64,
    /// Previous coordinates when an existing key was updated.
    pub old_value: Option<ValueCoords>,
}

impl CreateOrUpdateCtx {
    /// Creates a context for inserting `prefix || key` with `value`.
    pub fn new(key_prefix: Bytes, key: Bytes, value: ValueCoords) -> Self {
        Self {
            key_prefix,
            key,
            value,
            created: false,
            key_index: 0,
            old_value: None,
        }
    }

    /// The whole key: prefix and key concatenated.
    pub fn whole_key(&self) -> Bytes {
        key::concat(&self.key_prefix, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_key_concatenates() {
        let ctx = CreateOrUpdateCtx::new(
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cd"),
            ValueCoords::default(),
        );
        assert_eq!(ctx.whole_key().as_ref(), b"abcd");
    }
}
