//! Ledger plus transaction pool: the state a node serves and produces from.

use crate::config::{ChainParams, NodeConfig};
use crate::core::block::Block;
use crate::core::ledger::{AppendOutcome, Ledger};
use crate::core::transaction::Transaction;
use crate::core::validator::{BlockValidator, ChainState, TransactionError, Validator};
use crate::storage::memory_storage::MemoryStore;
use crate::storage::storage_trait::BlockStore;
use crate::storage::txpool::{PoolError, TxPool};
use crate::types::address::Address;
use crate::types::encoding::Encode;
use crate::utils::time::now_millis;
use crate::{debug, info};
use std::sync::Arc;

/// Bytes reserved for the header and length prefixes when filling a block.
const BLOCK_OVERHEAD: usize = 256;

/// Why a transaction did not enter the pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("invalid transaction: {0}")]
    Invalid(#[from] TransactionError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Chain state and pending transactions of one node.
pub struct Blockchain<V: Validator, S: BlockStore> {
    ledger: Ledger<V, S>,
    pool: TxPool,
    params: ChainParams,
}

impl Blockchain<BlockValidator, MemoryStore> {
    /// Proof-of-work chain kept in memory, rooted at the configured genesis.
    pub fn new(config: &NodeConfig) -> Self {
        Self::with_validator_and_store(config, BlockValidator::from_config(config), MemoryStore::new())
    }
}

impl<V: Validator, S: BlockStore> Blockchain<V, S> {
    pub fn with_validator_and_store(config: &NodeConfig, validator: V, store: S) -> Self {
        let genesis = Block::genesis(&config.chain);
        info!(
            "initializing blockchain: genesis={} difficulty={} bits",
            genesis.hash(),
            config.chain.difficulty_bits
        );
        Self {
            ledger: Ledger::new(genesis, validator, store, config),
            pool: TxPool::new(config.tx_pool_capacity),
            params: config.chain,
        }
    }

    pub fn ledger(&self) -> &Ledger<V, S> {
        &self.ledger
    }

    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    /// Appends a block and reconciles the pool with the new canonical chain:
    /// confirmed transactions leave it, demoted ones come back. The pool is
    /// updated under the ledger lock, in chain order.
    pub fn import_block(&self, block: impl Into<Arc<Block>>) -> AppendOutcome {
        self.ledger.append_with(block, |outcome| {
            if !outcome.confirmed.is_empty() {
                self.pool.remove_batch(&outcome.confirmed);
            }
            for tx in &outcome.demoted {
                if let Err(err) = self.pool.insert(tx.clone()) {
                    debug!("demoted transaction {} not re-pooled: {}", tx.id(), err);
                }
            }
        })
    }

    /// Validates a transaction against the canonical chain and pools it.
    pub fn import_transaction(&self, tx: Transaction) -> Result<(), ImportError> {
        self.ledger.validator().validate_transaction(&tx, &self.ledger)?;
        self.pool.insert(tx)?;
        Ok(())
    }

    /// Builds and seals a child of the current head from pending transactions.
    ///
    /// The block is not imported. Sealing may be expensive under proof of work.
    pub fn build_block(&self, producer: Address) -> Block {
        self.build_block_at(producer, now_millis())
    }

    /// Like [`Blockchain::build_block`] with an explicit timestamp. The
    /// timestamp is raised to one past the parent's if needed.
    pub fn build_block_at(&self, producer: Address, timestamp: u64) -> Block {
        let parent = self.ledger.head();
        let mut size_left = self.params.max_block_bytes.saturating_sub(BLOCK_OVERHEAD);
        let mut transactions = Vec::new();
        let mut stale = Vec::new();

        for tx in self.pool.pending(self.params.max_block_transactions) {
            // Confirmed while it was being admitted to the pool.
            if self.ledger.is_confirmed(&tx.id()) {
                stale.push(tx.id());
                continue;
            }
            let size = tx.encoded_len();
            if size > size_left {
                continue;
            }
            size_left -= size;
            transactions.push(tx);
        }
        if !stale.is_empty() {
            self.pool.remove_batch(&stale);
        }

        let timestamp = timestamp.max(parent.header().timestamp + 1);
        let unsealed = Block::new(&parent, producer, transactions, timestamp);
        let header = self.ledger.validator().seal(*unsealed.header());
        let block = unsealed.with_header(header);

        debug!(
            "built block {} at height {} with {} transactions",
            block.hash(),
            block.height(),
            block.transactions().len()
        );
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::AppendResult;
    use crate::crypto::key_pair::{PrivateKey, Signature};
    use crate::utils::test_utils::utils::{TestValidator, build_child, test_validator};

    fn chain(config: &NodeConfig) -> Blockchain<TestValidator, MemoryStore> {
        Blockchain::with_validator_and_store(config, test_validator(config), MemoryStore::new())
    }

    #[test]
    fn pooled_transactions_end_up_in_built_block() {
        let config = NodeConfig::dev();
        let chain = chain(&config);
        let key = PrivateKey::new();
        let tx = Transaction::new(b"hello", 0, &key);

        chain.import_transaction(tx.clone()).unwrap();
        assert!(chain.pool().contains(&tx.id()));

        let block = chain.build_block(Address::zero());
        assert_eq!(block.transactions(), &[tx.clone()]);
        assert_eq!(block.parent_hash(), chain.ledger().genesis().hash());

        let outcome = chain.import_block(block);
        assert_eq!(outcome.result, AppendResult::Extended);
        assert!(chain.pool().is_empty());
        assert_eq!(
            chain.import_transaction(tx.clone()),
            Err(ImportError::Invalid(TransactionError::AlreadyConfirmed(tx.id())))
        );
    }

    #[test]
    fn bad_signature_is_not_pooled() {
        let config = NodeConfig::dev();
        let chain = chain(&config);
        let key = PrivateKey::new();
        let tx = Transaction::from_parts(key.public_key(), 0, b"x".into(), Signature([0; 64]));

        assert_eq!(
            chain.import_transaction(tx),
            Err(ImportError::Invalid(TransactionError::InvalidSignature))
        );
        assert!(chain.pool().is_empty());
    }

    #[test]
    fn duplicate_transaction_reports_pool_error() {
        let config = NodeConfig::dev();
        let chain = chain(&config);
        let tx = Transaction::new(b"once", 3, &PrivateKey::new());

        chain.import_transaction(tx.clone()).unwrap();
        assert_eq!(
            chain.import_transaction(tx.clone()),
            Err(ImportError::Pool(PoolError::Duplicate(tx.id())))
        );
    }

    #[test]
    fn built_block_respects_transaction_limit() {
        let mut config = NodeConfig::dev();
        config.chain.max_block_transactions = 2;
        let chain = chain(&config);
        let key = PrivateKey::new();
        for nonce in 0..5 {
            chain
                .import_transaction(Transaction::new(b"tx", nonce, &key))
                .unwrap();
        }

        let block = chain.build_block(Address::zero());
        assert_eq!(block.transactions().len(), 2);
        assert_eq!(block.transactions()[0].nonce(), 0);
        assert_eq!(chain.import_block(block).result, AppendResult::Extended);
        assert_eq!(chain.pool().len(), 3);
    }

    #[test]
    fn timestamp_is_raised_above_parent() {
        let config = NodeConfig::dev();
        let chain = chain(&config);
        let block = chain.build_block_at(Address::zero(), 0);
        assert_eq!(block.header().timestamp, config.chain.genesis_timestamp + 1);
    }

    #[test]
    fn reorganization_returns_transactions_to_pool() {
        let config = NodeConfig::dev();
        let chain = chain(&config);
        let genesis = Arc::clone(chain.ledger().genesis());
        let tx = Transaction::new(b"moved", 0, &PrivateKey::new());

        // Two competing branches: `a` carries the transaction, `b` does not
        // and grows one block taller.
        let a1 = build_child(&genesis, 1, vec![tx.clone()]);
        let b1 = build_child(&genesis, 2, Vec::new());
        let b2 = build_child(&b1, 2, Vec::new());

        assert!(chain.import_block(a1.clone()).is_accepted());
        chain.import_block(b1);
        let outcome = chain.import_block(b2.clone());

        assert_eq!(chain.ledger().head().hash(), b2.hash());
        assert!(!chain.ledger().snapshot().contains(&a1));
        let demoted: Vec<_> = outcome.demoted.iter().map(Transaction::id).collect();
        if !demoted.is_empty() {
            assert_eq!(demoted, vec![tx.id()]);
        }
        assert!(chain.pool().contains(&tx.id()));
    }

    #[test]
    fn confirmed_transaction_left_in_pool_is_not_built_again() {
        let config = NodeConfig::dev();
        let chain = chain(&config);
        let tx = Transaction::new(b"late", 0, &PrivateKey::new());

        let block = build_child(chain.ledger().genesis(), 1, vec![tx.clone()]);
        assert_eq!(chain.import_block(block).result, AppendResult::Extended);
        // Pooled behind the ledger's back, as a racing import could.
        chain.pool().insert(tx.clone()).unwrap();

        let next = chain.build_block(Address::zero());
        assert!(next.transactions().is_empty());
        assert!(!chain.pool().contains(&tx.id()));
        assert_eq!(chain.import_block(next).result, AppendResult::Extended);
    }

    #[test]
    fn pool_follows_confirmation_when_imports_race() {
        let config = NodeConfig::dev();
        for round in 0..50u8 {
            let chain = Arc::new(chain(&config));
            let genesis = Arc::clone(chain.ledger().genesis());
            let tx = Transaction::new(vec![round], 0, &PrivateKey::new());
            chain.import_transaction(tx.clone()).unwrap();

            let a1 = build_child(&genesis, 1, vec![tx.clone()]);
            let b1 = build_child(&genesis, 2, Vec::new());
            let b2 = build_child(&b1, 2, Vec::new());

            let carrier = {
                let chain = Arc::clone(&chain);
                std::thread::spawn(move || {
                    chain.import_block(a1);
                })
            };
            let rival = {
                let chain = Arc::clone(&chain);
                std::thread::spawn(move || {
                    chain.import_block(b1);
                    chain.import_block(b2);
                })
            };
            carrier.join().unwrap();
            rival.join().unwrap();

            assert!(!chain.ledger().is_confirmed(&tx.id()));
            assert!(chain.pool().contains(&tx.id()));
        }
    }

    #[test]
    fn proof_of_work_blocks_are_sealed() {
        let mut config = NodeConfig::dev();
        config.chain.difficulty_bits = 6;
        let chain = Blockchain::new(&config);

        let block = chain.build_block(Address([7; 20]));
        assert!(block.hash().leading_zero_bits() >= 6);
        assert_eq!(chain.import_block(block).result, AppendResult::Extended);
    }
}
