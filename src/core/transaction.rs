//! Signed, immutable transactions.

use crate::crypto::key_pair::{PrivateKey, PublicKey, Signature};
use crate::types::address::Address;
use crate::types::bytes::Bytes;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::types::hash::Hash;

const TX_ID_DOMAIN: &[u8] = b"TXID";
const TX_SIGNING_DOMAIN: &[u8] = b"TX";

/// An opaque payload authorized by its sender.
///
/// The id is computed once when the value is built or decoded. Fields are
/// read-only; a different payload or nonce means a different transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    from: PublicKey,
    nonce: u64,
    payload: Bytes,
    signature: Signature,
    id: Hash,
}

impl Transaction {
    /// Builds and signs a transaction with `key`.
    pub fn new(payload: impl Into<Bytes>, nonce: u64, key: &PrivateKey) -> Self {
        let from = key.public_key();
        let payload = payload.into();
        let digest = Self::signing_hash(&from, nonce, &payload);
        let signature = key.sign(digest.as_slice());
        Self::from_parts(from, nonce, payload, signature)
    }

    /// Assembles a transaction from already-signed parts without checking the signature.
    pub fn from_parts(from: PublicKey, nonce: u64, payload: Bytes, signature: Signature) -> Self {
        let mut tx = Self {
            from,
            nonce,
            payload,
            signature,
            id: Hash::zero(),
        };
        tx.id = Hash::tagged(TX_ID_DOMAIN, &tx);
        tx
    }

    pub fn id(&self) -> Hash {
        self.id
    }

    pub fn from(&self) -> &PublicKey {
        &self.from
    }

    pub fn sender(&self) -> Address {
        self.from.address()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Checks that the signature was produced by `from` over this content.
    pub fn verify(&self) -> bool {
        let digest = Self::signing_hash(&self.from, self.nonce, &self.payload);
        self.from.verify(digest.as_slice(), &self.signature)
    }

    fn signing_hash(from: &PublicKey, nonce: u64, payload: &Bytes) -> Hash {
        let mut h = Hash::sha3();
        h.update(TX_SIGNING_DOMAIN);
        from.encode(&mut h);
        nonce.encode(&mut h);
        payload.encode(&mut h);
        h.finalize()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl Encode for Transaction {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.from.encode(out);
        self.nonce.encode(out);
        self.payload.encode(out);
        self.signature.encode(out);
    }
}

impl Decode for Transaction {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let from = PublicKey::decode(input)?;
        let nonce = u64::decode(input)?;
        let payload = Bytes::decode(input)?;
        let signature = Signature::decode(input)?;
        Ok(Self::from_parts(from, nonce, payload, signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transaction_verifies() {
        let key = PrivateKey::new();
        let tx = Transaction::new("hello", 0, &key);
        assert!(tx.verify());
        assert_eq!(tx.sender(), key.public_key().address());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = PrivateKey::new();
        let tx = Transaction::new("hello", 3, &key);
        let forged = Transaction::from_parts(*tx.from(), 3, Bytes::from("hellO"), *tx.signature());
        assert!(!forged.verify());
        assert_ne!(forged.id(), tx.id());
    }

    #[test]
    fn tampered_nonce_fails_verification() {
        let key = PrivateKey::new();
        let tx = Transaction::new("hello", 3, &key);
        let forged = Transaction::from_parts(*tx.from(), 4, tx.payload().clone(), *tx.signature());
        assert!(!forged.verify());
    }

    #[test]
    fn substituted_sender_fails_verification() {
        let tx = Transaction::new("hello", 0, &PrivateKey::new());
        let other = PrivateKey::new().public_key();
        let forged = Transaction::from_parts(other, 0, tx.payload().clone(), *tx.signature());
        assert!(!forged.verify());
    }

    #[test]
    fn decode_restores_id_and_signature() {
        let tx = Transaction::new(vec![1u8, 2, 3], 9, &PrivateKey::new());
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded.id(), tx.id());
        assert!(decoded.verify());
    }

    #[test]
    fn id_covers_the_signature() {
        let key = PrivateKey::new();
        let tx = Transaction::new("same", 0, &key);
        let mut sig = *tx.signature();
        sig.0[63] ^= 1;
        let altered = Transaction::from_parts(*tx.from(), 0, tx.payload().clone(), sig);
        assert_ne!(altered.id(), tx.id());
    }
}
