//! Wire protocol between nodes.
//!
//! Every frame carries exactly one [`Message`], encoded with the canonical
//! codec: a one-byte variant tag followed by the variant's fields.

use crate::core::block::{Block, Header};
use crate::core::transaction::Transaction;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use orion_derive::BinaryCodec;

/// Protocol revision advertised in the handshake. Peers on another revision
/// are disconnected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on headers or blocks served per request.
pub const MAX_ITEMS_PER_MESSAGE: u32 = 512;

/// Largest encoded message a transport carries.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Variant tag and length prefix around the blocks of a `Blocks` message.
const BLOCKS_ENVELOPE_BYTES: usize = 1 + 8;

/// Number of blocks of at most `max_block_bytes` each that always fit in one
/// `Blocks` message. Never less than one.
pub fn blocks_per_message(max_block_bytes: usize) -> usize {
    ((MAX_MESSAGE_BYTES - BLOCKS_ENVELOPE_BYTES) / max_block_bytes.max(1)).max(1)
}

/// Takes blocks in order while a `Blocks` message holding them stays within
/// `limit` bytes. Stops at the first block that does not fit.
pub fn pack_blocks(blocks: impl IntoIterator<Item = Block>, limit: usize) -> Vec<Block> {
    let mut size = BLOCKS_ENVELOPE_BYTES;
    let mut packed = Vec::new();
    for block in blocks {
        size += block.encoded_len();
        if size > limit {
            break;
        }
        packed.push(block);
    }
    packed
}

/// Kind of an announced or requested item.
#[derive(BinaryCodec, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Block,
    Transaction,
}

/// Inventory entry: what an item is and its content hash.
#[derive(BinaryCodec, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Item {
    pub kind: ItemKind,
    pub hash: Hash,
}

impl Item {
    pub fn block(hash: Hash) -> Self {
        Self {
            kind: ItemKind::Block,
            hash,
        }
    }

    pub fn transaction(hash: Hash) -> Self {
        Self {
            kind: ItemKind::Transaction,
            hash,
        }
    }
}

/// First message on every connection, sent by both sides.
#[derive(BinaryCodec, Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    /// Random per-process node identity.
    pub identity: Hash,
    pub genesis: Hash,
    pub head_height: u64,
    pub head_hash: Hash,
}

#[derive(BinaryCodec, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    /// The sender has these items.
    InvAnnounce(Vec<Item>),
    /// Request for the full items.
    GetData(Vec<Item>),
    Block(Block),
    Transaction(Transaction),
    /// Canonical headers following `from`, at most `limit`.
    GetHeaders { from: Hash, limit: u32 },
    /// Headers in ascending height order.
    Headers(Vec<Header>),
    /// Block bodies by hash.
    GetBlocks(Vec<Hash>),
    Blocks(Vec<Block>),
    /// Requested items the sender does not have.
    NotFound(Vec<Item>),
}

impl Message {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::InvAnnounce(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Transaction(_) => "transaction",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetBlocks(_) => "getblocks",
            Message::Blocks(_) => "blocks",
            Message::NotFound(_) => "notfound",
        }
    }
}
