//! Immutable, cheaply cloneable byte buffer.

use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink, decode_len, take};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Shared immutable bytes.
///
/// Transaction payloads and encoded messages are handed between the ledger,
/// the pool and network tasks; cloning only bumps a reference count.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Bytes(Arc<[u8]>);

impl Bytes {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(data.into()))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes(0x")?;
        for byte in self.0.iter().take(16) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > 16 {
            write!(f, "..; {} bytes", self.0.len())?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(Arc::from(v))
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for Bytes {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl<const N: usize> From<&[u8; N]> for Bytes {
    fn from(arr: &[u8; N]) -> Self {
        Self::from(arr.as_slice())
    }
}

impl Encode for Bytes {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.0.len().encode(out);
        out.write(&self.0);
    }
}

impl Decode for Bytes {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(input)?;
        take(input, len).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let a = Bytes::from("payload");
        let b = a.clone();
        assert!(std::ptr::eq(a.as_slice(), b.as_slice()));
    }

    #[test]
    fn encodes_like_a_byte_vector() {
        let data = Bytes::from(&[1u8, 2, 3]);
        assert_eq!(data.to_bytes(), vec![1u8, 2, 3].to_bytes());
        assert_eq!(Bytes::from_bytes(&data.to_bytes()).unwrap(), data);
    }

    #[test]
    fn debug_truncates_long_buffers() {
        let long = Bytes::new(vec![0xABu8; 40]);
        let rendered = format!("{:?}", long);
        assert!(rendered.contains("40 bytes"));
        assert!(rendered.len() < 80);
    }
}
