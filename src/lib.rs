//! Blockchain node core.
//!
//! Provides the chain model, validation, a fork-aware ledger, peer-to-peer
//! synchronization and the [`node::Node`] façade tying them together.

pub mod config;
pub mod core;
pub mod crypto;
pub mod network;
pub mod node;
pub mod storage;
pub mod types;
pub mod utils;
