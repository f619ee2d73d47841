//! Primitive types shared by every layer of the node.
//!
//! - `Hash`: 32-byte SHA3-256 content identifier
//! - `Encode`/`Decode`: the canonical binary codec used for hashing and the wire
//! - `Bytes`: shared immutable buffer
//! - `Address`: 20-byte producer identity

pub mod address;
pub mod bytes;
pub mod encoding;
pub mod hash;
pub mod merkle_tree;
pub mod wrapper_types;
