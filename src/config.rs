//! Node configuration.
//!
//! Every tunable of the ledger, the validator and the sync engine lives in
//! [`NodeConfig`]. [`ChainParams`] holds the consensus-critical subset that all
//! nodes of one network must agree on; changing any of it changes the genesis
//! hash or the set of valid blocks.

use std::time::Duration;

/// Consensus-critical parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainParams {
    /// Genesis timestamp in unix milliseconds.
    pub genesis_timestamp: u64,
    /// Leading zero bits a block hash needs under proof of work.
    pub difficulty_bits: u32,
    /// Maximum number of transactions in one block.
    pub max_block_transactions: usize,
    /// Maximum encoded size of one block.
    pub max_block_bytes: usize,
    /// Maximum payload size of one transaction.
    pub max_payload_bytes: usize,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            genesis_timestamp: 1_700_000_000_000,
            difficulty_bits: 16,
            max_block_transactions: 1_000,
            max_block_bytes: 2 * 1024 * 1024,
            max_payload_bytes: 64 * 1024,
        }
    }
}

/// All node options with their defaults.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub chain: ChainParams,
    /// How far a block timestamp may run ahead of the local clock.
    pub max_clock_skew: Duration,
    /// How long an orphan waits for its parent before being dropped.
    pub orphan_ttl: Duration,
    /// Orphan pool bound; the oldest orphan is evicted first.
    pub max_orphans: usize,
    /// Side branches forking more than this many blocks below the head are pruned.
    pub prune_depth: u64,
    /// Capacity of the gossip de-duplication cache.
    pub seen_cache_size: usize,
    /// Headers or bodies requested per sync round trip.
    pub sync_batch_size: u32,
    /// Time a peer has to answer one sync request.
    pub sync_batch_timeout: Duration,
    /// Attempts per batch before the peer is dropped.
    pub max_sync_attempts: u32,
    /// Base delay before a timed out batch is retried; doubles per attempt.
    pub retry_backoff: Duration,
    /// Protocol violations tolerated before a peer is disconnected.
    pub max_misbehavior: u32,
    /// Peers that have not completed the handshake by then are dropped.
    pub handshake_timeout: Duration,
    /// Period of the orphan, prune and peer sweep.
    pub sweep_interval: Duration,
    /// Pending transaction bound.
    pub tx_pool_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain: ChainParams::default(),
            max_clock_skew: Duration::from_secs(15),
            orphan_ttl: Duration::from_secs(600),
            max_orphans: 1_024,
            prune_depth: 128,
            seen_cache_size: 8_192,
            sync_batch_size: 128,
            sync_batch_timeout: Duration::from_secs(10),
            max_sync_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            max_misbehavior: 3,
            handshake_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            tx_pool_capacity: 10_000,
        }
    }
}

impl NodeConfig {
    /// Settings for local networks and tests: no proof of work, fast timers.
    pub fn dev() -> Self {
        Self {
            chain: ChainParams {
                difficulty_bits: 0,
                ..ChainParams::default()
            },
            sync_batch_size: 16,
            sync_batch_timeout: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }
}
