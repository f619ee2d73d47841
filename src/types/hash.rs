//! 32-byte SHA3-256 digest and an incremental builder.

use crate::types::encoding::{Encode, EncodeSink};
use orion_derive::BinaryCodec;
use sha3::{Digest, Sha3_256};
use std::fmt;

/// SHA3-256 digest length in bytes.
pub const HASH_LEN: usize = 32;

/// Content identifier for blocks and transactions.
///
/// Ordering is lexicographic over the raw bytes; chain selection relies on
/// it to break ties between equally tall tips.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash, Ord, PartialOrd, BinaryCodec)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Starts an incremental SHA3-256 computation.
    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// Hashes the canonical encoding of `value` under a domain tag.
    ///
    /// The tag keeps digests of different object kinds from colliding even
    /// when their encodings happen to coincide.
    pub fn tagged<T: Encode + ?Sized>(domain: &[u8], value: &T) -> Hash {
        let mut builder = Hash::sha3();
        builder.update(domain);
        value.encode(&mut builder);
        builder.finalize()
    }

    /// Number of leading zero bits, most significant byte first.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0 {
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

/// Incremental SHA3-256 hasher.
///
/// Implements [`EncodeSink`] so encodable values stream straight into the
/// digest.
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}
