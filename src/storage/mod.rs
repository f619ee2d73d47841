//! Storage subsystem.
//!
//! - [`storage_trait`]: the [`BlockStore`](storage_trait::BlockStore) key-value contract
//! - [`memory_storage`]: in-memory implementation
//! - [`txpool`]: pending transactions awaiting inclusion

pub mod memory_storage;
pub mod storage_trait;
pub mod txpool;
