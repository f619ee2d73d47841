//! Schnorr key pairs on secp256k1.
//!
//! Transactions are authorized with BIP-340 Schnorr signatures. Keys are
//! generated from OS randomness; persistence is left to the wallet layer.

use crate::types::address::Address;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{SigningKey, VerifyingKey};
use orion_derive::BinaryCodec;
use rand_core::OsRng;
use std::fmt;

/// Length of a serialized Schnorr signature.
pub const SIGNATURE_LEN: usize = 64;

/// Length of a serialized x-only public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Signing half of a key pair. Never encoded or sent over the wire.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    pub fn new() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Rebuilds a key from a 32-byte scalar, or `None` if it is out of range.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes).ok().map(|key| Self { key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(*self.key.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        let signature: k256::schnorr::Signature = self.key.sign(data);
        Signature(signature.to_bytes())
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({})", self.public_key().address())
    }
}

/// Verifying half of a key pair, with its address cached.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
    address: Address,
}

impl PublicKey {
    fn from_verifying_key(key: VerifyingKey) -> Self {
        let address = Address::from_key_bytes(&key.to_bytes());
        Self { key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.to_bytes().into()
    }

    /// Returns `true` if `signature` is a valid signature of `data` by this key.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        match k256::schnorr::Signature::try_from(signature.0.as_slice()) {
            Ok(parsed) => self.key.verify(data, &parsed).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.address)
    }
}

impl Encode for PublicKey {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.to_bytes());
    }
}

impl Decode for PublicKey {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = <[u8; PUBLIC_KEY_LEN]>::decode(input)?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|_| DecodeError::InvalidValue("public key is not on the curve"))?;
        Ok(Self::from_verifying_key(key))
    }
}

/// Raw Schnorr signature bytes.
///
/// Kept unparsed so that a malformed signature still decodes and is then
/// rejected by verification rather than by the codec.
#[derive(Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub struct Signature(pub [u8; SIGNATURE_LEN]);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}
