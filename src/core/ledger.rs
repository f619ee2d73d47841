//! Block tree, canonical chain and fork choice.
//!
//! Every retained block lives in an arena keyed by hash; parent hashes are
//! the back references and a child index allows walking forward. The
//! canonical chain is published as an immutable [`ChainView`] behind an
//! `Arc`. Readers clone the `Arc` and never observe a half-applied
//! reorganization: the view changes with a single pointer swap.
//!
//! Fork choice: the taller tip wins; between tips of equal height the one
//! with the lexicographically smaller hash wins. The rule is a total order,
//! so nodes holding the same set of blocks agree on the head whatever order
//! the blocks arrived in.
//!
//! All mutations (append, orphan adoption, reorganization, pruning) are
//! serialized by one mutex. Context-free checks run before it is taken.
//! Checks that depend on the block's ancestry, such as a transaction repeated
//! from an ancestor, run under it.

use crate::config::NodeConfig;
use crate::core::block::{Block, Header};
use crate::core::orphans::OrphanPool;
use crate::core::transaction::Transaction;
use crate::core::validator::{BlockError, ChainState, Validator};
use crate::storage::storage_trait::BlockStore;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use crate::{debug, error, info};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// How an appended block was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResult {
    /// The block became the new head on top of the previous head.
    Extended,
    /// The block was stored on a side branch; the head is unchanged.
    NewBranch,
    /// The block's branch overtook the canonical chain.
    Reorganized { depth: u64 },
    /// The block failed validation and was discarded.
    Rejected(BlockError),
    /// The parent is unknown; the block waits in the orphan pool.
    Orphaned,
    /// The block is already stored or already waiting as an orphan.
    Duplicate,
}

/// Full effect of one [`Ledger::append`] call.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub result: AppendResult,
    /// Blocks attached to the tree, the appended one first, then any orphans
    /// it released.
    pub connected: Vec<Arc<Block>>,
    /// Transactions that left the canonical chain and are not on the new one.
    pub demoted: Vec<Transaction>,
    /// Ids of transactions that entered the canonical chain.
    pub confirmed: Vec<Hash>,
}

impl AppendOutcome {
    fn only(result: AppendResult) -> Self {
        Self {
            result,
            connected: Vec::new(),
            demoted: Vec::new(),
            confirmed: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self.result,
            AppendResult::Extended | AppendResult::NewBranch | AppendResult::Reorganized { .. }
        )
    }
}

/// Head summary published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash,
    pub height: u64,
}

/// Immutable snapshot of the canonical chain; index equals height.
#[derive(Clone, Debug)]
pub struct ChainView {
    blocks: Vec<Arc<Block>>,
}

impl ChainView {
    pub fn head(&self) -> &Arc<Block> {
        // The genesis block is always present.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        (self.blocks.len() - 1) as u64
    }

    pub fn tip(&self) -> ChainTip {
        ChainTip {
            hash: self.head().hash(),
            height: self.height(),
        }
    }

    pub fn at(&self, height: u64) -> Option<&Arc<Block>> {
        usize::try_from(height).ok().and_then(|h| self.blocks.get(h))
    }

    pub fn contains(&self, block: &Block) -> bool {
        self.at(block.height())
            .is_some_and(|b| b.hash() == block.hash())
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }
}

/// `true` if tip `a` beats tip `b`.
pub fn is_better(a: &Block, b: &Block) -> bool {
    is_better_tip(a.height(), &a.hash(), b.height(), &b.hash())
}

pub fn is_better_tip(a_height: u64, a_hash: &Hash, b_height: u64, b_hash: &Hash) -> bool {
    a_height > b_height || (a_height == b_height && a_hash < b_hash)
}

struct Inner {
    children: HashMap<Hash, Vec<Hash>>,
    orphans: OrphanPool,
    /// Canonical heights below this have had their side branches pruned.
    pruned_below: u64,
}

/// The node's block store and fork-choice engine.
pub struct Ledger<V: Validator, S: BlockStore> {
    validator: V,
    store: S,
    prune_depth: u64,
    genesis: Arc<Block>,
    blocks: DashMap<Hash, Arc<Block>>,
    tx_index: DashMap<Hash, Hash>,
    inner: Mutex<Inner>,
    view: RwLock<Arc<ChainView>>,
    tip_tx: watch::Sender<ChainTip>,
}

impl<V: Validator, S: BlockStore> Ledger<V, S> {
    pub fn new(genesis: Block, validator: V, store: S, config: &NodeConfig) -> Self {
        let genesis = Arc::new(genesis);
        let view = ChainView {
            blocks: vec![Arc::clone(&genesis)],
        };
        let (tip_tx, _) = watch::channel(view.tip());

        if let Err(err) = store.put(genesis.hash(), genesis.to_bytes()) {
            error!("failed to persist genesis {}: {}", genesis.hash(), err);
        }

        let blocks = DashMap::new();
        blocks.insert(genesis.hash(), Arc::clone(&genesis));

        Self {
            validator,
            store,
            prune_depth: config.prune_depth,
            genesis,
            blocks,
            tx_index: DashMap::new(),
            inner: Mutex::new(Inner {
                children: HashMap::new(),
                orphans: OrphanPool::new(config.orphan_ttl, config.max_orphans),
                pruned_below: 0,
            }),
            view: RwLock::new(Arc::new(view)),
            tip_tx,
        }
    }

    pub fn validator(&self) -> &V {
        &self.validator
    }

    pub fn genesis(&self) -> &Arc<Block> {
        &self.genesis
    }

    /// Current canonical chain. Cheap; never blocks on appends.
    pub fn snapshot(&self) -> Arc<ChainView> {
        Arc::clone(&self.view.read())
    }

    pub fn head(&self) -> Arc<Block> {
        Arc::clone(self.snapshot().head())
    }

    pub fn tip(&self) -> ChainTip {
        self.snapshot().tip()
    }

    /// Receiver notified on every head change.
    pub fn subscribe(&self) -> watch::Receiver<ChainTip> {
        self.tip_tx.subscribe()
    }

    /// Any retained block, canonical or side branch.
    pub fn get_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.blocks.get(hash).map(|b| Arc::clone(b.value()))
    }

    /// Whether the block is stored or waiting as an orphan.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash) || self.inner.lock().orphans.contains(hash)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.lock().orphans.len()
    }

    /// Up to `limit` canonical blocks starting at `from` (inclusive).
    ///
    /// Empty when `from` is unknown or not on the canonical chain.
    pub fn chain_from(&self, from: &Hash, limit: usize) -> Vec<Arc<Block>> {
        let view = self.snapshot();
        let Some(start) = self.get_block(from) else {
            return Vec::new();
        };
        if !view.contains(&start) {
            return Vec::new();
        }
        let start = start.height() as usize;
        let end = start.saturating_add(limit).min(view.blocks.len());
        view.blocks[start..end].to_vec()
    }

    /// Up to `limit` canonical headers following `from`.
    ///
    /// If `from` is on a side branch the headers start after its fork point;
    /// if it is unknown they start after genesis.
    pub fn headers_after(&self, from: &Hash, limit: usize) -> Vec<Header> {
        let view = self.snapshot();
        let mut cursor = self.get_block(from);
        let fork_height = loop {
            match cursor {
                None => break 0,
                Some(block) if view.contains(&block) => break block.height(),
                Some(block) => cursor = self.get_block(&block.parent_hash()),
            }
        };
        let start = fork_height as usize + 1;
        let end = start.saturating_add(limit).min(view.blocks.len());
        if start >= end {
            return Vec::new();
        }
        view.blocks[start..end].iter().map(|b| *b.header()).collect()
    }

    /// Validates and inserts a block, adopting any orphans it unblocks.
    pub fn append(&self, block: impl Into<Arc<Block>>) -> AppendOutcome {
        self.append_with(block, |_| {})
    }

    /// Like [`Ledger::append`], running `apply` on the outcome of an accepted
    /// block before the ledger lock is released. State derived from the
    /// canonical chain stays in step with it when appends race.
    pub fn append_with(
        &self,
        block: impl Into<Arc<Block>>,
        apply: impl FnOnce(&AppendOutcome),
    ) -> AppendOutcome {
        let block: Arc<Block> = block.into();
        let hash = block.hash();

        if self.blocks.contains_key(&hash) {
            return AppendOutcome::only(AppendResult::Duplicate);
        }
        if let Err(err) = self.validator.check_structure(&block) {
            debug!("rejected block {}: {}", hash, err);
            return AppendOutcome::only(AppendResult::Rejected(err));
        }
        let tx_verdict = self.validator.check_transactions(&block);

        let mut inner = self.inner.lock();
        if self.blocks.contains_key(&hash) || inner.orphans.contains(&hash) {
            return AppendOutcome::only(AppendResult::Duplicate);
        }

        let Some(parent) = self.get_block(&block.parent_hash()) else {
            debug!("orphaned block {} waiting for {}", hash, block.parent_hash());
            if let Some(evicted) = inner.orphans.insert(block, tx_verdict, Instant::now()) {
                debug!("orphan pool full, evicted {}", evicted);
            }
            return AppendOutcome::only(AppendResult::Orphaned);
        };

        let old_head = Arc::clone(self.snapshot().head());
        let mut best = Arc::clone(&old_head);

        if let Err(err) = self.attach(&mut inner, &block, &parent, tx_verdict, &mut best) {
            debug!("rejected block {}: {}", hash, err);
            return AppendOutcome::only(AppendResult::Rejected(err));
        }

        let mut connected = vec![Arc::clone(&block)];
        self.adopt_orphans(&mut inner, hash, &mut connected, &mut best);

        // Classified by where the head ended up, released orphans included.
        let (result, demoted, confirmed) = if best.hash() == old_head.hash() {
            (AppendResult::NewBranch, Vec::new(), Vec::new())
        } else {
            let fork = self.fork_point(&old_head, &best);
            let result = if fork.hash() == old_head.hash() {
                debug!("extended chain to height {} ({})", best.height(), best.hash());
                AppendResult::Extended
            } else {
                let depth = old_head.height() - fork.height();
                info!(
                    "reorganized {} blocks, new head {} at height {}",
                    depth,
                    best.hash(),
                    best.height()
                );
                AppendResult::Reorganized { depth }
            };
            let (demoted, confirmed) = self.publish(&mut inner, &fork, &old_head, &best);
            (result, demoted, confirmed)
        };

        let outcome = AppendOutcome {
            result,
            connected,
            demoted,
            confirmed,
        };
        apply(&outcome);
        drop(inner);
        outcome
    }

    /// Drops side branches forking more than `prune_depth` below the head.
    /// Returns how many blocks were removed.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock();
        self.prune_locked(&mut inner)
    }

    /// Drops orphans older than their TTL.
    pub fn evict_expired_orphans(&self) -> usize {
        self.inner.lock().orphans.evict_expired(Instant::now())
    }

    /// Checks a block against its parent and links it into the tree.
    /// Moves `best` to the block if it wins the fork choice.
    fn attach(
        &self,
        inner: &mut Inner,
        block: &Arc<Block>,
        parent: &Arc<Block>,
        tx_verdict: Result<(), BlockError>,
        best: &mut Arc<Block>,
    ) -> Result<(), BlockError> {
        self.validator.check_against_parent(block, parent.header())?;
        tx_verdict?;
        self.check_replays(block, parent)?;

        let hash = block.hash();
        self.blocks.insert(hash, Arc::clone(block));
        inner
            .children
            .entry(block.parent_hash())
            .or_default()
            .push(hash);
        // A late fork below the prune watermark must be revisited.
        inner.pruned_below = inner.pruned_below.min(parent.height());
        if let Err(err) = self.store.put(hash, block.to_bytes()) {
            error!("failed to persist block {}: {}", hash, err);
        }

        if is_better(block, best) {
            *best = Arc::clone(block);
        }
        Ok(())
    }

    /// Refuses transactions already included by an ancestor of `block`.
    ///
    /// Side-branch ancestors are walked down to the canonical chain; below
    /// that point the transaction index answers.
    fn check_replays(&self, block: &Block, parent: &Arc<Block>) -> Result<(), BlockError> {
        if block.transactions().is_empty() {
            return Ok(());
        }
        let view = self.snapshot();
        let mut on_branch: HashMap<Hash, Hash> = HashMap::new();
        let mut cursor = Arc::clone(parent);
        while !view.contains(&cursor) {
            for tx in cursor.transactions() {
                on_branch.entry(tx.id()).or_insert(cursor.hash());
            }
            match self.get_block(&cursor.parent_hash()) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        let fork_height = cursor.height();

        for tx in block.transactions() {
            let id = tx.id();
            let included = on_branch.get(&id).copied().or_else(|| {
                self.tx_index
                    .get(&id)
                    .map(|entry| *entry.value())
                    .filter(|hash| self.get_block(hash).is_some_and(|b| b.height() <= fork_height))
            });
            if let Some(ancestor) = included {
                return Err(BlockError::Replayed {
                    tx: id,
                    block: ancestor,
                });
            }
        }
        Ok(())
    }

    fn adopt_orphans(
        &self,
        inner: &mut Inner,
        root: Hash,
        connected: &mut Vec<Arc<Block>>,
        best: &mut Arc<Block>,
    ) {
        let mut queue = vec![root];
        while let Some(parent_hash) = queue.pop() {
            let Some(parent) = self.get_block(&parent_hash) else {
                continue;
            };
            for orphan in inner.orphans.take_children(&parent_hash) {
                let hash = orphan.block.hash();
                match self.attach(inner, &orphan.block, &parent, orphan.tx_verdict, best) {
                    Ok(()) => {
                        debug!("adopted orphan {} at height {}", hash, orphan.block.height());
                        connected.push(orphan.block);
                        queue.push(hash);
                    }
                    Err(err) => debug!("dropped orphan {}: {}", hash, err),
                }
            }
        }
    }

    /// Nearest common ancestor of two retained blocks.
    fn fork_point(&self, a: &Arc<Block>, b: &Arc<Block>) -> Arc<Block> {
        let mut a = Arc::clone(a);
        let mut b = Arc::clone(b);
        while a.hash() != b.hash() {
            let step_a = a.height() >= b.height();
            let cursor = if step_a { &a } else { &b };
            let Some(parent) = self.get_block(&cursor.parent_hash()) else {
                // Only genesis lacks a parent, and both sides descend from it.
                return Arc::clone(&self.genesis);
            };
            if step_a {
                a = parent;
            } else {
                b = parent;
            }
        }
        a
    }

    /// Blocks after `ancestor` up to and including `tip`, oldest first.
    fn path_from(&self, ancestor: &Block, tip: &Arc<Block>) -> Vec<Arc<Block>> {
        let mut path = Vec::with_capacity((tip.height() - ancestor.height()) as usize);
        let mut cursor = Arc::clone(tip);
        while cursor.hash() != ancestor.hash() {
            let parent = self.get_block(&cursor.parent_hash());
            path.push(cursor);
            match parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Swaps in the canonical view ending at `best`, which forks from
    /// `old_head` at `fork`, and notifies subscribers.
    fn publish(
        &self,
        inner: &mut Inner,
        fork: &Arc<Block>,
        old_head: &Arc<Block>,
        best: &Arc<Block>,
    ) -> (Vec<Transaction>, Vec<Hash>) {
        let removed = self.path_from(fork, old_head);
        let added = self.path_from(fork, best);

        let mut confirmed = Vec::new();
        let mut added_ids = HashSet::new();
        for block in &added {
            for tx in block.transactions() {
                added_ids.insert(tx.id());
                confirmed.push(tx.id());
            }
        }
        let mut demoted = Vec::new();
        for block in &removed {
            for tx in block.transactions() {
                self.tx_index.remove(&tx.id());
                if !added_ids.contains(&tx.id()) {
                    demoted.push(tx.clone());
                }
            }
        }
        for block in &added {
            for tx in block.transactions() {
                self.tx_index.insert(tx.id(), block.hash());
            }
        }

        {
            let mut guard = self.view.write();
            let view = Arc::make_mut(&mut guard);
            view.blocks.truncate(fork.height() as usize + 1);
            view.blocks.extend(added);
        }

        let tip = ChainTip {
            hash: best.hash(),
            height: best.height(),
        };
        self.tip_tx.send_replace(tip);
        self.prune_locked(inner);

        (demoted, confirmed)
    }

    fn prune_locked(&self, inner: &mut Inner) -> usize {
        let view = self.snapshot();
        let limit = view.height().saturating_sub(self.prune_depth);
        let mut removed = 0;

        for height in inner.pruned_below..limit {
            let Some(canonical) = view.at(height) else {
                break;
            };
            let next = view.at(height + 1).map(|b| b.hash());
            let Some(children) = inner.children.get_mut(&canonical.hash()) else {
                continue;
            };
            let side: Vec<Hash> = children
                .iter()
                .copied()
                .filter(|h| Some(*h) != next)
                .collect();
            children.retain(|h| Some(*h) == next);
            for root in side {
                removed += self.remove_subtree(inner, root);
            }
        }
        inner.pruned_below = inner.pruned_below.max(limit);

        if removed > 0 {
            debug!("pruned {} side-branch blocks", removed);
        }
        removed
    }

    fn remove_subtree(&self, inner: &mut Inner, root: Hash) -> usize {
        let mut stack = vec![root];
        let mut removed = 0;
        while let Some(hash) = stack.pop() {
            if let Some(children) = inner.children.remove(&hash) {
                stack.extend(children);
            }
            if self.blocks.remove(&hash).is_some() {
                removed += 1;
                if let Err(err) = self.store.delete(&hash) {
                    error!("failed to delete pruned block {}: {}", hash, err);
                }
            }
        }
        removed
    }
}

impl<V: Validator, S: BlockStore> ChainState for Ledger<V, S> {
    fn header(&self, hash: &Hash) -> Option<Header> {
        self.blocks.get(hash).map(|b| *b.header())
    }

    fn is_confirmed(&self, tx_id: &Hash) -> bool {
        self.tx_index.contains_key(tx_id)
    }
}
