//! Blocks whose parent has not arrived yet.
//!
//! Orphans are indexed by the parent they wait for. The pool is bounded both
//! in size (oldest first out) and in time (entries older than the TTL are
//! swept).

use crate::core::block::Block;
use crate::core::validator::BlockError;
use crate::types::hash::Hash;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct Orphan {
    pub block: Arc<Block>,
    /// Outcome of the context-free transaction checks, computed on arrival.
    pub tx_verdict: Result<(), BlockError>,
    arrived: Instant,
}

pub(crate) struct OrphanPool {
    ttl: Duration,
    capacity: usize,
    by_hash: HashMap<Hash, Orphan>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    /// Arrival order. May hold hashes already adopted; those are skipped.
    arrival: VecDeque<Hash>,
}

impl OrphanPool {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            by_hash: HashMap::new(),
            by_parent: HashMap::new(),
            arrival: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Stores an orphan, evicting the oldest one when full. Returns the evicted hash.
    pub fn insert(
        &mut self,
        block: Arc<Block>,
        tx_verdict: Result<(), BlockError>,
        now: Instant,
    ) -> Option<Hash> {
        let hash = block.hash();
        if self.by_hash.contains_key(&hash) {
            return None;
        }

        let evicted = if self.by_hash.len() >= self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        self.by_parent
            .entry(block.parent_hash())
            .or_default()
            .push(hash);
        self.by_hash.insert(
            hash,
            Orphan {
                block,
                tx_verdict,
                arrived: now,
            },
        );
        self.arrival.push_back(hash);
        self.compact();
        evicted
    }

    /// Removes and returns every orphan waiting on `parent`.
    pub fn take_children(&mut self, parent: &Hash) -> Vec<Orphan> {
        let Some(hashes) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        hashes
            .into_iter()
            .filter_map(|hash| self.by_hash.remove(&hash))
            .collect()
    }

    /// Drops orphans older than the TTL. Returns how many were dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.arrival.front().copied() {
            match self.by_hash.get(&front) {
                None => {
                    self.arrival.pop_front();
                }
                Some(orphan) if now.saturating_duration_since(orphan.arrived) >= self.ttl => {
                    self.arrival.pop_front();
                    self.remove(&front);
                    evicted += 1;
                }
                Some(_) => break,
            }
        }
        evicted
    }

    fn pop_oldest(&mut self) -> Option<Hash> {
        while let Some(hash) = self.arrival.pop_front() {
            if self.remove(&hash) {
                return Some(hash);
            }
        }
        None
    }

    fn remove(&mut self, hash: &Hash) -> bool {
        let Some(orphan) = self.by_hash.remove(hash) else {
            return false;
        };
        let parent = orphan.block.parent_hash();
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        true
    }

    fn compact(&mut self) {
        if self.arrival.len() > 2 * self.capacity + 16 {
            let by_hash = &self.by_hash;
            self.arrival.retain(|h| by_hash.contains_key(h));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::types::address::Address;

    fn chain(len: usize) -> Vec<Arc<Block>> {
        let mut blocks = vec![Arc::new(Block::genesis(&ChainParams::default()))];
        for i in 0..len {
            let parent = Arc::clone(&blocks[i]);
            let ts = parent.header().timestamp + 1;
            blocks.push(Arc::new(Block::new(&parent, Address::zero(), Vec::new(), ts)));
        }
        blocks
    }

    #[test]
    fn children_are_indexed_by_parent() {
        let blocks = chain(3);
        let mut pool = OrphanPool::new(Duration::from_secs(60), 10);
        let now = Instant::now();
        pool.insert(Arc::clone(&blocks[2]), Ok(()), now);
        pool.insert(Arc::clone(&blocks[3]), Ok(()), now);

        let waiting = pool.take_children(&blocks[1].hash());
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].block.hash(), blocks[2].hash());
        assert_eq!(pool.len(), 1);
        assert!(pool.take_children(&blocks[1].hash()).is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let blocks = chain(3);
        let mut pool = OrphanPool::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        pool.insert(Arc::clone(&blocks[1]), Ok(()), now);
        pool.insert(Arc::clone(&blocks[2]), Ok(()), now);
        let evicted = pool.insert(Arc::clone(&blocks[3]), Ok(()), now);

        assert_eq!(evicted, Some(blocks[1].hash()));
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&blocks[1].hash()));
    }

    #[test]
    fn ttl_sweep_drops_only_expired() {
        let blocks = chain(2);
        let mut pool = OrphanPool::new(Duration::from_secs(10), 10);
        let start = Instant::now();
        pool.insert(Arc::clone(&blocks[1]), Ok(()), start);
        pool.insert(Arc::clone(&blocks[2]), Ok(()), start + Duration::from_secs(5));

        assert_eq!(pool.evict_expired(start + Duration::from_secs(9)), 0);
        assert_eq!(pool.evict_expired(start + Duration::from_secs(11)), 1);
        assert!(pool.contains(&blocks[2].hash()));
        assert!(!pool.contains(&blocks[1].hash()));
    }
}
