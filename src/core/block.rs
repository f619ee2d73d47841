//! Block headers and immutable blocks.

use crate::config::ChainParams;
use crate::core::transaction::Transaction;
use crate::types::address::Address;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use orion_derive::BinaryCodec;
use std::fmt;

/// Header layout version produced by this node.
pub const HEADER_VERSION: u32 = 1;

const BLOCK_HEADER_DOMAIN: &[u8] = b"BLOCK_HEADER";

/// Block metadata and commitments. The block hash covers exactly these fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BinaryCodec)]
pub struct Header {
    pub version: u32,
    /// Distance from genesis (genesis = 0).
    pub height: u64,
    /// Hash of the parent block; zero for genesis.
    pub previous_block: Hash,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    /// Merkle root of the transaction ids.
    pub merkle_root: Hash,
    /// Proof field interpreted by the consensus predicate.
    pub nonce: u64,
    pub producer: Address,
}

impl Header {
    pub fn hash(&self) -> Hash {
        Hash::tagged(BLOCK_HEADER_DOMAIN, self)
    }
}

/// A header plus its ordered transactions.
///
/// Blocks never change after construction; the hash is computed once and
/// equality compares hashes. Building a variant (another nonce, another
/// transaction list) always yields a new `Block`.
#[derive(Clone)]
pub struct Block {
    header: Header,
    transactions: Box<[Transaction]>,
    hash: Hash,
}

impl Block {
    /// Builds an unsealed child of `parent` (nonce 0).
    pub fn new(
        parent: &Block,
        producer: Address,
        transactions: Vec<Transaction>,
        timestamp: u64,
    ) -> Self {
        let header = Header {
            version: HEADER_VERSION,
            height: parent.height() + 1,
            previous_block: parent.hash(),
            timestamp,
            merkle_root: MerkleTree::from_transactions(&transactions),
            nonce: 0,
            producer,
        };
        Self::from_parts(header, transactions)
    }

    /// Wraps an existing header and transaction list, computing the hash.
    pub fn from_parts(header: Header, transactions: impl Into<Box<[Transaction]>>) -> Self {
        Self {
            hash: header.hash(),
            header,
            transactions: transactions.into(),
        }
    }

    /// Returns a copy of this block carrying a different header.
    pub fn with_header(&self, header: Header) -> Self {
        Self::from_parts(header, self.transactions.clone())
    }

    /// The deterministic root block every node of a network shares.
    pub fn genesis(params: &ChainParams) -> Self {
        let header = Header {
            version: HEADER_VERSION,
            height: 0,
            previous_block: Hash::zero(),
            timestamp: params.genesis_timestamp,
            merkle_root: Hash::zero(),
            nonce: 0,
            producer: Address::zero(),
        };
        Self::from_parts(header, Vec::new())
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.previous_block
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_genesis_shaped(&self) -> bool {
        self.header.height == 0 || self.header.previous_block.is_zero()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("height", &self.header.height)
            .field("hash", &self.hash)
            .field("parent", &self.header.previous_block)
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

impl Encode for Block {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.header.encode(out);
        self.transactions.encode(out);
    }
}

impl Decode for Block {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let header = Header::decode(input)?;
        let transactions = Box::<[Transaction]>::decode(input)?;
        Ok(Self::from_parts(header, transactions))
    }
}
