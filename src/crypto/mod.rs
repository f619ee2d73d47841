//! Key generation, signing and verification.

pub mod key_pair;
