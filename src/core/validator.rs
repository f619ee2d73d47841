//! Block and transaction validation.
//!
//! [`Validator`] is the strategy the ledger is generic over. The default
//! [`BlockValidator`] runs these checks in order and stops at the first
//! failure:
//!
//! 1. structure (version, limits, Merkle root)
//! 2. linkage (parent known, otherwise the block is an orphan)
//! 3. height (`parent.height + 1`)
//! 4. timestamp (after the parent, not too far ahead of the local clock)
//! 5. proof ([`ProofPredicate`])
//! 6. transactions (signatures, then [`ConflictPredicate`])
//!
//! Checks 1 and 6 need no chain context, so the ledger runs them before it
//! takes its lock and only evaluates 2 to 5 inside the critical section.

use crate::config::{ChainParams, NodeConfig};
use crate::core::block::{Block, HEADER_VERSION, Header};
use crate::core::transaction::Transaction;
use crate::types::address::Address;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use crate::utils::time::now_millis;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Error classes used to decide what happens to a candidate and its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; rejected and never retried.
    Structural,
    /// Parent unknown; the block waits in the orphan pool.
    Linkage,
    /// Proof, height, timestamp or signature failure.
    Consensus,
    /// Conflicting transactions.
    Conflict,
}

impl ErrorKind {
    /// Whether a peer that sent an item failing with this kind should be penalized.
    pub fn penalizable(self) -> bool {
        !matches!(self, ErrorKind::Linkage)
    }
}

/// Why a transaction was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("transaction {0:?} is already confirmed")]
    AlreadyConfirmed(Hash),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::PayloadTooLarge { .. } => ErrorKind::Structural,
            TransactionError::InvalidSignature => ErrorKind::Consensus,
            TransactionError::AlreadyConfirmed(_) => ErrorKind::Conflict,
        }
    }
}

/// Why a block was refused or could not be placed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u32),

    #[error("genesis-shaped block cannot be appended")]
    GenesisShaped,

    #[error("{count} transactions exceed limit of {max}")]
    TooManyTransactions { count: usize, max: usize },

    #[error("block encodes to {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("merkle root does not match transactions")]
    MerkleMismatch,

    #[error("unknown parent {0:?}")]
    UnknownParent(Hash),

    #[error("height {actual} does not follow parent height {parent}")]
    BadHeight { parent: u64, actual: u64 },

    #[error("timestamp {timestamp} is not after parent timestamp {parent}")]
    TimestampNotIncreasing { parent: u64, timestamp: u64 },

    #[error("timestamp {timestamp} is ahead of local time {now} by more than {skew_ms} ms")]
    TimestampInFuture { timestamp: u64, now: u64, skew_ms: u64 },

    #[error("invalid proof: {0}")]
    InvalidProof(String),

    #[error("transaction {index}: {source}")]
    Transaction {
        index: usize,
        #[source]
        source: TransactionError,
    },

    #[error("transactions {first:?} and {second:?} conflict: {reason}")]
    Conflict {
        first: Hash,
        second: Hash,
        reason: &'static str,
    },

    #[error("transaction {tx:?} is already included in ancestor {block:?}")]
    Replayed { tx: Hash, block: Hash },
}

impl BlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockError::UnsupportedVersion(_)
            | BlockError::GenesisShaped
            | BlockError::TooManyTransactions { .. }
            | BlockError::TooLarge { .. }
            | BlockError::MerkleMismatch => ErrorKind::Structural,
            BlockError::UnknownParent(_) => ErrorKind::Linkage,
            BlockError::BadHeight { .. }
            | BlockError::TimestampNotIncreasing { .. }
            | BlockError::TimestampInFuture { .. }
            | BlockError::InvalidProof(_) => ErrorKind::Consensus,
            BlockError::Transaction { source, .. } => source.kind(),
            BlockError::Conflict { .. } | BlockError::Replayed { .. } => ErrorKind::Conflict,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.kind() == ErrorKind::Linkage
    }
}

/// Read access to the chain a candidate is validated against.
pub trait ChainState {
    /// Header of any retained block, canonical or not.
    fn header(&self, hash: &Hash) -> Option<Header>;

    /// Whether a transaction is included in the canonical chain.
    fn is_confirmed(&self, tx_id: &Hash) -> bool;
}

/// Pluggable consensus rule over the header's proof field.
pub trait ProofPredicate: Send + Sync + 'static {
    /// Accepts or refuses `header` (whose hash is `hash`) as a child of `parent`.
    fn verify(&self, header: &Header, hash: &Hash, parent: &Header) -> Result<(), String>;

    /// Producer side: returns a header that satisfies [`ProofPredicate::verify`].
    fn seal(&self, header: Header) -> Header;
}

/// Constant-difficulty proof of work over the header hash.
#[derive(Clone, Copy, Debug)]
pub struct ProofOfWork {
    pub difficulty_bits: u32,
}

impl ProofPredicate for ProofOfWork {
    fn verify(&self, _header: &Header, hash: &Hash, _parent: &Header) -> Result<(), String> {
        let bits = hash.leading_zero_bits();
        if bits < self.difficulty_bits {
            return Err(format!(
                "hash has {} leading zero bits, {} required",
                bits, self.difficulty_bits
            ));
        }
        Ok(())
    }

    fn seal(&self, mut header: Header) -> Header {
        while header.hash().leading_zero_bits() < self.difficulty_bits {
            header.nonce = header.nonce.wrapping_add(1);
        }
        header
    }
}

/// Accepts every proof. For tests and permissioned setups.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProof;

impl ProofPredicate for NoProof {
    fn verify(&self, _: &Header, _: &Hash, _: &Header) -> Result<(), String> {
        Ok(())
    }

    fn seal(&self, header: Header) -> Header {
        header
    }
}

/// Pluggable rule over the full transaction set of a block.
pub trait ConflictPredicate: Send + Sync + 'static {
    fn check(&self, transactions: &[Transaction]) -> Result<(), BlockError>;
}

/// Rejects repeated transactions and two transactions from one sender with
/// the same nonce.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonceConflicts;

impl ConflictPredicate for NonceConflicts {
    fn check(&self, transactions: &[Transaction]) -> Result<(), BlockError> {
        let mut ids = HashSet::with_capacity(transactions.len());
        let mut slots: HashMap<(Address, u64), Hash> = HashMap::with_capacity(transactions.len());

        for tx in transactions {
            if !ids.insert(tx.id()) {
                return Err(BlockError::Conflict {
                    first: tx.id(),
                    second: tx.id(),
                    reason: "duplicate transaction",
                });
            }
            if let Some(first) = slots.insert((tx.sender(), tx.nonce()), tx.id()) {
                return Err(BlockError::Conflict {
                    first,
                    second: tx.id(),
                    reason: "same sender and nonce",
                });
            }
        }
        Ok(())
    }
}

/// Decides whether blocks and transactions may enter the ledger.
///
/// Implementations must be pure: the same inputs always give the same answer
/// (apart from the local clock used by the timestamp check).
pub trait Validator: Send + Sync + 'static {
    /// Version, size limits, Merkle root and genesis shape.
    fn check_structure(&self, block: &Block) -> Result<(), BlockError>;

    /// Height, timestamp and proof, given the already located parent.
    fn check_against_parent(&self, block: &Block, parent: &Header) -> Result<(), BlockError>;

    /// Signatures and payload limits of every transaction, then conflicts.
    fn check_transactions(&self, block: &Block) -> Result<(), BlockError>;

    /// Transaction admission for the pool.
    fn validate_transaction(
        &self,
        tx: &Transaction,
        chain: &dyn ChainState,
    ) -> Result<(), TransactionError>;

    /// Makes `header` satisfy the proof predicate.
    fn seal(&self, header: Header) -> Header;

    /// The full pipeline, in order.
    fn validate_block(&self, block: &Block, chain: &dyn ChainState) -> Result<(), BlockError> {
        self.check_structure(block)?;
        let parent = chain
            .header(&block.parent_hash())
            .ok_or(BlockError::UnknownParent(block.parent_hash()))?;
        self.check_against_parent(block, &parent)?;
        self.check_transactions(block)
    }
}

/// Default validator, parameterized by its proof and conflict rules.
pub struct BlockValidator<P = ProofOfWork, C = NonceConflicts> {
    params: ChainParams,
    max_clock_skew: Duration,
    proof: P,
    conflicts: C,
    clock: fn() -> u64,
}

impl BlockValidator<ProofOfWork, NonceConflicts> {
    /// Proof of work at the configured difficulty with nonce conflict detection.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.chain,
            config.max_clock_skew,
            ProofOfWork {
                difficulty_bits: config.chain.difficulty_bits,
            },
            NonceConflicts,
        )
    }
}

impl<P: ProofPredicate, C: ConflictPredicate> BlockValidator<P, C> {
    pub fn new(params: ChainParams, max_clock_skew: Duration, proof: P, conflicts: C) -> Self {
        Self {
            params,
            max_clock_skew,
            proof,
            conflicts,
            clock: now_millis,
        }
    }

    /// Replaces the wall clock used for the future-timestamp check.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    fn check_payload(&self, tx: &Transaction) -> Result<(), TransactionError> {
        let size = tx.payload().len();
        if size > self.params.max_payload_bytes {
            return Err(TransactionError::PayloadTooLarge {
                size,
                max: self.params.max_payload_bytes,
            });
        }
        Ok(())
    }
}

impl<P: ProofPredicate, C: ConflictPredicate> Validator for BlockValidator<P, C> {
    fn check_structure(&self, block: &Block) -> Result<(), BlockError> {
        let header = block.header();
        if header.version != HEADER_VERSION {
            return Err(BlockError::UnsupportedVersion(header.version));
        }
        if block.is_genesis_shaped() {
            return Err(BlockError::GenesisShaped);
        }

        let count = block.transactions().len();
        if count > self.params.max_block_transactions {
            return Err(BlockError::TooManyTransactions {
                count,
                max: self.params.max_block_transactions,
            });
        }

        let size = block.encoded_len();
        if size > self.params.max_block_bytes {
            return Err(BlockError::TooLarge {
                size,
                max: self.params.max_block_bytes,
            });
        }

        if MerkleTree::from_transactions(block.transactions()) != header.merkle_root {
            return Err(BlockError::MerkleMismatch);
        }
        Ok(())
    }

    fn check_against_parent(&self, block: &Block, parent: &Header) -> Result<(), BlockError> {
        let header = block.header();

        if parent.height.checked_add(1) != Some(header.height) {
            return Err(BlockError::BadHeight {
                parent: parent.height,
                actual: header.height,
            });
        }

        if header.timestamp <= parent.timestamp {
            return Err(BlockError::TimestampNotIncreasing {
                parent: parent.timestamp,
                timestamp: header.timestamp,
            });
        }
        let now = (self.clock)();
        let skew_ms = self.max_clock_skew.as_millis() as u64;
        if header.timestamp > now.saturating_add(skew_ms) {
            return Err(BlockError::TimestampInFuture {
                timestamp: header.timestamp,
                now,
                skew_ms,
            });
        }

        self.proof
            .verify(header, &block.hash(), parent)
            .map_err(BlockError::InvalidProof)
    }

    fn check_transactions(&self, block: &Block) -> Result<(), BlockError> {
        for (index, tx) in block.transactions().iter().enumerate() {
            let verdict = self.check_payload(tx).and_then(|()| {
                if tx.verify() {
                    Ok(())
                } else {
                    Err(TransactionError::InvalidSignature)
                }
            });
            verdict.map_err(|source| BlockError::Transaction { index, source })?;
        }
        self.conflicts.check(block.transactions())
    }

    fn validate_transaction(
        &self,
        tx: &Transaction,
        chain: &dyn ChainState,
    ) -> Result<(), TransactionError> {
        self.check_payload(tx)?;
        if !tx.verify() {
            return Err(TransactionError::InvalidSignature);
        }
        if chain.is_confirmed(&tx.id()) {
            return Err(TransactionError::AlreadyConfirmed(tx.id()));
        }
        Ok(())
    }

    fn seal(&self, header: Header) -> Header {
        self.proof.seal(header)
    }
}
