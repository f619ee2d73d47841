//! 20-byte identities derived from public keys.

use crate::types::hash::Hash;
use orion_derive::BinaryCodec;
use std::fmt;

/// Identifies a block producer or node.
///
/// Derived from a public key by taking the last 20 bytes of its SHA3-256
/// digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, BinaryCodec)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const fn zero() -> Address {
        Address([0u8; 20])
    }

    /// Derives an address from raw public key bytes.
    pub fn from_key_bytes(key: &[u8]) -> Address {
        let mut builder = Hash::sha3();
        builder.update(key);
        let digest = builder.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.0[12..]);
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}
