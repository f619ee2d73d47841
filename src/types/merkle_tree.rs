//! Merkle roots over transaction ids.
//!
//! - No leaves gives the zero hash.
//! - A level with an odd count pairs its last node with itself.
//! - Interior nodes are domain separated from leaves.

use crate::core::transaction::Transaction;
use crate::types::hash::Hash;

const MERKLE_NODE: &[u8] = b"MERKLE_NODE";

pub struct MerkleTree;

impl MerkleTree {
    fn hash_pair(left: Hash, right: Hash) -> Hash {
        let mut h = Hash::sha3();
        h.update(MERKLE_NODE);
        h.update(left.as_slice());
        h.update(right.as_slice());
        h.finalize()
    }

    /// Reduces `nodes` in place to a single root.
    pub fn from_leaves(mut nodes: Vec<Hash>) -> Hash {
        if nodes.is_empty() {
            return Hash::zero();
        }

        let mut len = nodes.len();
        while len > 1 {
            let mut write = 0;
            for read in (0..len).step_by(2) {
                let left = nodes[read];
                let right = if read + 1 < len { nodes[read + 1] } else { left };
                nodes[write] = Self::hash_pair(left, right);
                write += 1;
            }
            len = write;
        }
        nodes[0]
    }

    /// Root over the ids of `txs` in block order.
    pub fn from_transactions(txs: &[Transaction]) -> Hash {
        Self::from_leaves(txs.iter().map(Transaction::id).collect())
    }
}
