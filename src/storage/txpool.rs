//! Pool of validated transactions waiting for block inclusion.
//!
//! Transactions are kept in arrival order. One `(sender, nonce)` slot holds at
//! most one transaction, so a block assembled from the pool never trips the
//! nonce conflict rule.

use crate::core::transaction::Transaction;
use crate::types::address::Address;
use crate::types::hash::Hash;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Why the pool refused a transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("transaction {0:?} is already pending")]
    Duplicate(Hash),

    #[error("sender {sender} already has a pending transaction with nonce {nonce}")]
    NonceTaken { sender: Address, nonce: u64 },

    #[error("pool is full ({0} transactions)")]
    Full(usize),
}

struct PoolEntry {
    tx: Transaction,
    seq: u64,
}

/// Thread-safe FIFO transaction pool.
pub struct TxPool {
    capacity: usize,
    entries: DashMap<Hash, PoolEntry>,
    slots: DashMap<(Address, u64), Hash>,
    /// Arrival sequence to id. Also serializes inserts and removals.
    order: Mutex<BTreeMap<u64, Hash>>,
    next_seq: Mutex<u64>,
}

impl TxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
            slots: DashMap::new(),
            order: Mutex::new(BTreeMap::new()),
            next_seq: Mutex::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &Hash) -> Option<Transaction> {
        self.entries.get(id).map(|entry| entry.tx.clone())
    }

    /// Adds an already validated transaction.
    pub fn insert(&self, tx: Transaction) -> Result<(), PoolError> {
        let mut order = self.order.lock();
        let id = tx.id();
        if self.entries.contains_key(&id) {
            return Err(PoolError::Duplicate(id));
        }
        let slot = (tx.sender(), tx.nonce());
        if self.slots.contains_key(&slot) {
            return Err(PoolError::NonceTaken {
                sender: slot.0,
                nonce: slot.1,
            });
        }
        if self.entries.len() >= self.capacity {
            return Err(PoolError::Full(self.capacity));
        }

        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        order.insert(seq, id);
        self.slots.insert(slot, id);
        self.entries.insert(id, PoolEntry { tx, seq });
        Ok(())
    }

    /// Oldest `limit` transactions, left in the pool.
    pub fn pending(&self, limit: usize) -> Vec<Transaction> {
        let order = self.order.lock();
        order
            .values()
            .filter_map(|id| self.get(id))
            .take(limit)
            .collect()
    }

    /// Drops the given ids, typically those just confirmed in a block.
    pub fn remove_batch<'a>(&self, ids: impl IntoIterator<Item = &'a Hash>) -> usize {
        let mut order = self.order.lock();
        let mut removed = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(id) {
                order.remove(&entry.seq);
                self.slots
                    .remove_if(&(entry.tx.sender(), entry.tx.nonce()), |_, slot| slot == id);
                removed += 1;
            }
        }
        removed
    }
}
