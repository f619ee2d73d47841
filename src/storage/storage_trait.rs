//! Block persistence contract.
//!
//! The ledger keeps its working set in memory and writes every accepted block
//! through a [`BlockStore`], keyed by block hash. Values are the canonical
//! block encoding, so any store only has to move opaque bytes.

use crate::types::bytes::Bytes;
use crate::types::hash::Hash;

/// Errors reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Key-value store for encoded blocks.
///
/// Implementations must be thread-safe; the ledger calls them from whichever
/// task is appending. Writes of an existing key must be idempotent.
pub trait BlockStore: Send + Sync + 'static {
    /// Stores the encoded block under its hash.
    fn put(&self, hash: Hash, encoded: Bytes) -> Result<(), StorageError>;

    /// Loads an encoded block.
    fn get(&self, hash: &Hash) -> Result<Option<Bytes>, StorageError>;

    /// Removes a block; missing keys are not an error.
    fn delete(&self, hash: &Hash) -> Result<(), StorageError>;
}
