//! Node façade: the operations an embedding application or RPC layer calls.
//!
//! A [`Node`] owns the blockchain and a running sync engine. Local
//! submissions are validated and appended synchronously, then announced to
//! peers through the engine.

use crate::config::NodeConfig;
use crate::core::block::Block;
use crate::core::blockchain::{Blockchain, ImportError};
use crate::core::ledger::{AppendResult, ChainTip};
use crate::core::transaction::Transaction;
use crate::core::validator::{BlockError, BlockValidator};
use crate::info;
use crate::network::engine::{EngineHandle, EngineStopped, SyncEngine};
use crate::network::message::Item;
use crate::network::peer::PeerInfo;
use crate::network::transport::{Transport, TransportError};
use crate::storage::memory_storage::MemoryStore;
use crate::types::address::Address;
use crate::types::hash::Hash;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Blockchain flavor run by a node.
pub type NodeChain = Blockchain<BlockValidator, MemoryStore>;

/// Why a local submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Transaction(#[from] ImportError),

    #[error("block rejected: {0}")]
    Block(#[from] BlockError),

    /// The block was kept as an orphan; its parent is unknown.
    #[error("parent {0:?} is unknown, block kept as orphan")]
    Orphaned(Hash),

    #[error("block production was aborted")]
    ProductionAborted,

    #[error(transparent)]
    EngineStopped(#[from] EngineStopped),
}

pub struct Node {
    address: SocketAddr,
    chain: Arc<NodeChain>,
    engine: EngineHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Builds the blockchain for `config` and starts syncing over `transport`.
    pub async fn start<T: Transport>(
        config: NodeConfig,
        transport: Arc<T>,
    ) -> Result<Node, TransportError> {
        let chain = Arc::new(Blockchain::new(&config));
        let address = transport.addr();
        let (engine, task) = SyncEngine::spawn(config, transport, Arc::clone(&chain)).await?;
        info!(
            "node {} started at height {}",
            address,
            chain.ledger().tip().height
        );

        Ok(Node {
            address,
            chain,
            engine,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn blockchain(&self) -> &NodeChain {
        &self.chain
    }

    /// Validates and pools a transaction, then announces it. Returns its id.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Hash, SubmitError> {
        let id = tx.id();
        self.chain.import_transaction(tx)?;
        self.engine.announce(vec![Item::transaction(id)]).await?;
        Ok(id)
    }

    /// Appends a block and announces every block it connected.
    ///
    /// A block that is already known yields `Ok(AppendResult::Duplicate)`.
    pub async fn submit_block(&self, block: Block) -> Result<AppendResult, SubmitError> {
        let parent = block.parent_hash();
        let outcome = self.chain.import_block(block);
        match outcome.result {
            AppendResult::Rejected(err) => Err(SubmitError::Block(err)),
            AppendResult::Orphaned => Err(SubmitError::Orphaned(parent)),
            AppendResult::Duplicate => Ok(AppendResult::Duplicate),
            result => {
                let items = outcome
                    .connected
                    .iter()
                    .map(|block| Item::block(block.hash()))
                    .collect();
                self.engine.announce(items).await?;
                Ok(result)
            }
        }
    }

    /// Builds a block from pending transactions on top of the head, seals it
    /// and submits it.
    pub async fn produce_block(&self, producer: Address) -> Result<Block, SubmitError> {
        let chain = Arc::clone(&self.chain);
        let block = tokio::task::spawn_blocking(move || chain.build_block(producer))
            .await
            .map_err(|_| SubmitError::ProductionAborted)?;
        self.submit_block(block.clone()).await?;
        Ok(block)
    }

    pub fn query_head(&self) -> Arc<Block> {
        self.chain.ledger().head()
    }

    pub fn query_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.chain.ledger().get_block(hash)
    }

    /// Up to `limit` canonical blocks starting at `from`.
    pub fn query_chain(&self, from: &Hash, limit: usize) -> Vec<Arc<Block>> {
        self.chain.ledger().chain_from(from, limit)
    }

    /// Head changes, as they are published.
    pub fn subscribe(&self) -> watch::Receiver<ChainTip> {
        self.chain.ledger().subscribe()
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerInfo>, EngineStopped> {
        self.engine.peers().await
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<(), EngineStopped> {
        self.engine.connect(addr).await
    }

    /// Disconnects all peers and waits for the engine to exit.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("node {} shut down", self.address);
    }
}
