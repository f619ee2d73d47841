//! In-memory [`BlockStore`].

use crate::storage::storage_trait::{BlockStore, StorageError};
use crate::types::bytes::Bytes;
use crate::types::hash::Hash;
use dashmap::DashMap;

/// Sharded hash map of encoded blocks. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    blocks: DashMap<Hash, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for MemoryStore {
    fn put(&self, hash: Hash, encoded: Bytes) -> Result<(), StorageError> {
        self.blocks.insert(hash, encoded);
        Ok(())
    }

    fn get(&self, hash: &Hash) -> Result<Option<Bytes>, StorageError> {
        Ok(self.blocks.get(hash).map(|entry| entry.value().clone()))
    }

    fn delete(&self, hash: &Hash) -> Result<(), StorageError> {
        self.blocks.remove(hash);
        Ok(())
    }
}
