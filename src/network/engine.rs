//! Event loop tying the transport, the sync state machine and the chain together.
//!
//! A single task owns all protocol state. It multiplexes transport events,
//! commands from [`EngineHandle`]s, the sweep timer and head changes of the
//! ledger. Outgoing frames go through a bounded per-peer outbox drained by its
//! own writer task, so the loop never waits on a slow peer and frames to one
//! peer keep their order. A peer whose outbox fills up is dropped.
//!
//! Each peer has an inventory of items it is known to have, fed by what it
//! announces or sends and by what we announce to it. Announcements skip items
//! already in it. When the local head moves, peers whose last reported head is
//! worse hear about the new one.

use crate::config::NodeConfig;
use crate::core::block::Block;
use crate::core::blockchain::{Blockchain, ImportError};
use crate::core::ledger::{AppendOutcome, AppendResult, ChainTip, is_better_tip};
use crate::core::transaction::Transaction;
use crate::core::validator::{TransactionError, Validator};
use crate::network::gossip::{InFlight, SeenCache};
use crate::network::message::{
    Item, ItemKind, MAX_ITEMS_PER_MESSAGE, MAX_MESSAGE_BYTES, Message, pack_blocks,
};
use crate::network::peer::{PeerInfo, PeerState};
use crate::network::sync::{SyncAction, SyncManager, SyncSettings};
use crate::network::transport::{
    EVENT_CHANNEL_CAPACITY, Transport, TransportError, TransportEvent,
};
use crate::storage::storage_trait::BlockStore;
use crate::types::bytes::Bytes;
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use crate::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender, WeakSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Frames queued for one peer before it is considered stuck.
const OUTBOX_CAPACITY: usize = 256;

/// Items remembered per peer as known to it.
const KNOWN_ITEMS_PER_PEER: usize = 2_048;

/// The engine task has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sync engine stopped")]
pub struct EngineStopped;

enum Command {
    Announce(Vec<Item>),
    Connect(SocketAddr),
    DialFailed(SocketAddr),
    ListPeers(oneshot::Sender<Vec<PeerInfo>>),
    Shutdown,
}

/// Cheap, cloneable access to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<Command>,
}

impl EngineHandle {
    /// Relays items that were accepted locally to every ready peer.
    pub async fn announce(&self, items: Vec<Item>) -> Result<(), EngineStopped> {
        self.command(Command::Announce(items)).await
    }

    /// Dials `addr`. The outcome shows up in [`EngineHandle::peers`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), EngineStopped> {
        self.command(Command::Connect(addr)).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, EngineStopped> {
        let (reply, response) = oneshot::channel();
        self.command(Command::ListPeers(reply)).await?;
        response.await.map_err(|_| EngineStopped)
    }

    /// Asks the engine to disconnect every peer and exit.
    pub async fn shutdown(&self) {
        let _ = self.command(Command::Shutdown).await;
    }

    async fn command(&self, command: Command) -> Result<(), EngineStopped> {
        self.commands.send(command).await.map_err(|_| EngineStopped)
    }
}

/// Gossip and sync engine of one node.
pub struct SyncEngine<T: Transport, V: Validator, S: BlockStore> {
    config: NodeConfig,
    transport: Arc<T>,
    chain: Arc<Blockchain<V, S>>,
    sync: SyncManager,
    seen: SeenCache,
    in_flight: InFlight,
    outboxes: HashMap<SocketAddr, Sender<Bytes>>,
    known: HashMap<SocketAddr, SeenCache>,
    events: Receiver<TransportEvent>,
    commands: Receiver<Command>,
    /// Lets dial tasks report back without keeping the engine alive.
    self_commands: WeakSender<Command>,
    head: watch::Receiver<ChainTip>,
}

impl<T: Transport, V: Validator, S: BlockStore> SyncEngine<T, V, S> {
    /// Starts `transport` and spawns the engine task.
    pub async fn spawn(
        config: NodeConfig,
        transport: Arc<T>,
        chain: Arc<Blockchain<V, S>>,
    ) -> Result<(EngineHandle, JoinHandle<()>), TransportError> {
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        transport.start(event_tx).await?;

        let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let mut identity = [0u8; 32];
        OsRng.fill_bytes(&mut identity);
        let identity = Hash(identity);

        info!(
            "sync engine listening on {} (identity {})",
            transport.addr(),
            identity.short()
        );

        let engine = SyncEngine {
            sync: SyncManager::new(SyncSettings::from(&config), identity),
            seen: SeenCache::new(config.seen_cache_size),
            in_flight: InFlight::new(),
            outboxes: HashMap::new(),
            known: HashMap::new(),
            events,
            commands,
            self_commands: command_tx.downgrade(),
            head: chain.ledger().subscribe(),
            config,
            transport,
            chain,
        };
        let task = tokio::spawn(engine.run());
        Ok((EngineHandle { commands: command_tx }, task))
    }

    async fn run(mut self) {
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(event) = self.events.recv() => self.on_event(event),
                _ = sweep.tick() => self.sweep(),
                Ok(()) = self.head.changed() => {
                    let tip = *self.head.borrow_and_update();
                    self.on_head_changed(tip);
                }
            }
        }

        for peer in self.transport.peer_addrs() {
            self.transport.disconnect(peer);
        }
        info!("sync engine on {} stopped", self.transport.addr());
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Announce(items) => {
                for item in &items {
                    self.seen.insert(*item);
                }
                self.announce(items, None);
            }
            Command::Connect(addr) => self.dial(addr),
            Command::DialFailed(addr) => self.sync.on_dial_failed(addr),
            Command::ListPeers(reply) => {
                let _ = reply.send(self.sync.peers());
            }
            Command::Shutdown => {}
        }
    }

    fn dial(&mut self, addr: SocketAddr) {
        if addr == self.transport.addr() {
            return;
        }
        self.sync.on_dialing(addr, Instant::now());
        let transport = Arc::clone(&self.transport);
        let commands = self.self_commands.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.connect(addr).await {
                warn!("failed to connect to {}: {}", addr, err);
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::DialFailed(addr)).await;
                }
            }
        });
    }

    fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(peer) => self.on_connected(peer),
            TransportEvent::Message { from, payload } => self.on_frame(from, &payload),
            TransportEvent::Disconnected(peer) => {
                debug!("peer {} disconnected", peer);
                self.sync.on_disconnected(peer);
                self.forget_peer(peer);
            }
        }
    }

    fn on_connected(&mut self, peer: SocketAddr) {
        if self.sync.on_connected(peer, Instant::now()) {
            debug!("peer {} connected", peer);
            let handshake = self.sync.handshake(self.chain.ledger());
            self.send(peer, &Message::Handshake(handshake));
        }
    }

    fn on_frame(&mut self, from: SocketAddr, payload: &[u8]) {
        // A frame may overtake the `Connected` event of its connection.
        match self.sync.peer(&from).map(|info| info.state) {
            None => self.on_connected(from),
            Some(PeerState::Disconnected) => return,
            Some(_) => {}
        }

        let message = match Message::from_bytes(payload) {
            Ok(message) => message,
            Err(err) => {
                self.penalize(from, &format!("malformed message: {}", err));
                return;
            }
        };
        debug!("{} from {}", message.name(), from);

        if !matches!(message, Message::Handshake(_)) && !self.sync.is_ready(&from) {
            self.penalize(from, "message before handshake");
            return;
        }
        self.on_message(from, message);
    }

    fn on_message(&mut self, from: SocketAddr, message: Message) {
        let now = Instant::now();
        match message {
            Message::Handshake(handshake) => {
                let actions = self
                    .sync
                    .on_handshake(from, handshake, self.chain.ledger(), now);
                self.execute(actions);
            }
            Message::InvAnnounce(items) => self.on_inventory(from, items, now),
            Message::GetData(items) => self.on_get_data(from, items),
            Message::Block(block) => {
                if !self.in_flight.fulfil(&Item::block(block.hash()), from) {
                    self.penalize(from, "unsolicited block");
                    return;
                }
                let outcome = self.import_block(from, block);
                if outcome.result == AppendResult::Orphaned {
                    let actions = self.sync.on_orphan(from, self.chain.ledger(), now);
                    self.execute(actions);
                }
            }
            Message::Transaction(tx) => {
                if !self.in_flight.fulfil(&Item::transaction(tx.id()), from) {
                    self.penalize(from, "unsolicited transaction");
                    return;
                }
                self.import_transaction(from, tx);
            }
            Message::GetHeaders { from: start, limit } => {
                let limit = limit.min(MAX_ITEMS_PER_MESSAGE) as usize;
                let headers = self.chain.ledger().headers_after(&start, limit);
                self.send(from, &Message::Headers(headers));
            }
            Message::Headers(headers) => {
                match self
                    .sync
                    .on_headers(from, &headers, self.chain.ledger(), now)
                {
                    Ok(actions) => self.execute(actions),
                    Err(err) => self.penalize(from, &err.to_string()),
                }
            }
            Message::GetBlocks(hashes) => {
                let ledger = self.chain.ledger();
                let found = hashes
                    .iter()
                    .take(MAX_ITEMS_PER_MESSAGE as usize)
                    .filter_map(|hash| ledger.get_block(hash))
                    .map(|block| Block::clone(&block));
                // Bodies that do not fit are left out; the requester asks again.
                let blocks = pack_blocks(found, MAX_MESSAGE_BYTES);
                self.send(from, &Message::Blocks(blocks));
            }
            Message::Blocks(blocks) => match self.sync.on_blocks(from, blocks) {
                Ok(blocks) => {
                    for block in blocks {
                        self.import_block(from, block);
                    }
                    let actions = self.sync.after_import(from, self.chain.ledger(), now);
                    self.execute(actions);
                }
                Err(err) => self.penalize(from, &err.to_string()),
            },
            Message::NotFound(items) => {
                for item in &items {
                    self.in_flight.fulfil(item, from);
                }
            }
        }
    }

    fn on_inventory(&mut self, from: SocketAddr, items: Vec<Item>, now: Instant) {
        if items.len() > MAX_ITEMS_PER_MESSAGE as usize {
            self.penalize(from, "oversized inventory");
            return;
        }
        let mut wanted = Vec::new();
        for item in items {
            self.mark_known(from, item);
            if self.seen.contains(&item) || self.is_known(&item) {
                continue;
            }
            if self.in_flight.request(item, from, now) {
                wanted.push(item);
            }
        }
        if !wanted.is_empty() {
            self.send(from, &Message::GetData(wanted));
        }
    }

    fn on_get_data(&mut self, from: SocketAddr, items: Vec<Item>) {
        let mut missing = Vec::new();
        for item in items.into_iter().take(MAX_ITEMS_PER_MESSAGE as usize) {
            let reply = match item.kind {
                ItemKind::Block => self
                    .chain
                    .ledger()
                    .get_block(&item.hash)
                    .map(|block| Message::Block(Block::clone(&block))),
                ItemKind::Transaction => self.chain.pool().get(&item.hash).map(Message::Transaction),
            };
            match reply {
                Some(message) => self.send(from, &message),
                None => missing.push(item),
            }
        }
        if !missing.is_empty() {
            self.send(from, &Message::NotFound(missing));
        }
    }

    fn is_known(&self, item: &Item) -> bool {
        match item.kind {
            ItemKind::Block => self.chain.ledger().contains(&item.hash),
            ItemKind::Transaction => self.chain.pool().contains(&item.hash),
        }
    }

    fn import_block(&mut self, from: SocketAddr, block: Block) -> AppendOutcome {
        let hash = block.hash();
        let height = block.height();
        self.mark_known(from, Item::block(hash));
        let outcome = self.chain.import_block(block);
        if outcome.is_accepted() || outcome.result == AppendResult::Duplicate {
            self.sync.note_peer_head(from, height, hash);
        }
        match &outcome.result {
            AppendResult::Rejected(err) if err.kind().penalizable() => {
                self.penalize(from, &format!("invalid block {}: {}", hash.short(), err));
            }
            AppendResult::Rejected(err) => {
                debug!("block {} from {} rejected: {}", hash, from, err);
            }
            AppendResult::Duplicate => {
                self.seen.insert(Item::block(hash));
            }
            AppendResult::Orphaned => {}
            _ => {
                let items: Vec<Item> = outcome
                    .connected
                    .iter()
                    .map(|block| Item::block(block.hash()))
                    .collect();
                for item in &items {
                    self.seen.insert(*item);
                }
                self.announce(items, Some(from));
            }
        }
        outcome
    }

    fn import_transaction(&mut self, from: SocketAddr, tx: Transaction) {
        let item = Item::transaction(tx.id());
        self.mark_known(from, item);
        match self.chain.import_transaction(tx) {
            Ok(()) => {
                self.seen.insert(item);
                self.announce(vec![item], Some(from));
            }
            Err(ImportError::Invalid(TransactionError::AlreadyConfirmed(_))) => {
                self.seen.insert(item);
            }
            Err(ImportError::Invalid(err)) => {
                self.penalize(from, &format!("invalid transaction: {}", err));
            }
            Err(ImportError::Pool(err)) => {
                debug!("transaction {} from {} not pooled: {}", item.hash, from, err);
            }
        }
    }

    /// Sends an inventory of `items` to every ready peer except `skip`.
    fn announce(&mut self, items: Vec<Item>, skip: Option<SocketAddr>) {
        if items.is_empty() {
            return;
        }
        for peer in self.sync.ready_peers() {
            if Some(peer) != skip {
                self.announce_to(peer, &items);
            }
        }
    }

    /// Announces the items `peer` is not known to have.
    fn announce_to(&mut self, peer: SocketAddr, items: &[Item]) {
        let known = self
            .known
            .entry(peer)
            .or_insert_with(|| SeenCache::new(KNOWN_ITEMS_PER_PEER));
        let fresh: Vec<Item> = items.iter().copied().filter(|item| known.insert(*item)).collect();
        for batch in fresh.chunks(MAX_ITEMS_PER_MESSAGE as usize) {
            self.send(peer, &Message::InvAnnounce(batch.to_vec()));
        }
    }

    fn mark_known(&mut self, peer: SocketAddr, item: Item) {
        self.known
            .entry(peer)
            .or_insert_with(|| SeenCache::new(KNOWN_ITEMS_PER_PEER))
            .insert(item);
    }

    /// Tells ready peers that last reported a worse head about the new one.
    fn on_head_changed(&mut self, tip: ChainTip) {
        debug!("head is now {} at height {}", tip.hash, tip.height);
        let behind: Vec<SocketAddr> = self
            .sync
            .peers()
            .iter()
            .filter(|peer| {
                peer.state.is_ready()
                    && is_better_tip(tip.height, &tip.hash, peer.head_height, &peer.head_hash)
            })
            .map(|peer| peer.address)
            .collect();
        let head = [Item::block(tip.hash)];
        for peer in behind {
            self.announce_to(peer, &head);
        }
    }

    fn forget_peer(&mut self, peer: SocketAddr) {
        self.outboxes.remove(&peer);
        self.known.remove(&peer);
        self.in_flight.forget_peer(peer);
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let ledger = self.chain.ledger();
        let evicted = ledger.evict_expired_orphans();
        let pruned = ledger.prune();
        let expired = self.in_flight.expire(now, self.config.sync_batch_timeout);
        if evicted + pruned + expired > 0 {
            debug!(
                "sweep: {} orphans expired, {} blocks pruned, {} requests timed out",
                evicted, pruned, expired
            );
        }
        let actions = self.sync.tick(now);
        self.execute(actions);
    }

    fn penalize(&mut self, peer: SocketAddr, reason: &str) {
        warn!("peer {} misbehaved: {}", peer, reason);
        let actions = self.sync.penalize(peer, reason);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::Send { peer, message } => self.send(peer, &message),
                SyncAction::Disconnect { peer, reason } => {
                    warn!("disconnecting {}: {}", peer, reason);
                    self.forget_peer(peer);
                    self.transport.disconnect(peer);
                }
            }
        }
    }

    fn send(&mut self, peer: SocketAddr, message: &Message) {
        let payload = message.to_bytes();
        let transport = &self.transport;
        let outbox = self
            .outboxes
            .entry(peer)
            .or_insert_with(|| spawn_writer(Arc::clone(transport), peer));
        match outbox.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let actions = self.sync.disconnect(peer, "outbox full");
                self.execute(actions);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("dropped {} to {}: writer closed", message.name(), peer);
            }
        }
    }
}

/// Spawns the task writing frames to `peer` in order.
fn spawn_writer<T: Transport>(transport: Arc<T>, peer: SocketAddr) -> Sender<Bytes> {
    let (outbox, mut frames) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match transport.send_message(peer, frame).await {
                Ok(()) => {}
                Err(TransportError::FrameTooLarge { len, .. }) => {
                    warn!("dropped a frame of {} bytes to {}", len, peer);
                }
                Err(err) => {
                    debug!("writer to {} stopped: {}", peer, err);
                    break;
                }
            }
        }
    });
    outbox
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::local_transport::{LocalNetwork, LocalTransport};
    use crate::network::message::{Handshake, PROTOCOL_VERSION};
    use crate::storage::memory_storage::MemoryStore;
    use crate::types::address::Address;
    use crate::utils::test_utils::utils::{TestValidator, build_child, test_validator};
    use std::time::Duration;
    use tokio::time::timeout;

    type TestChain = Blockchain<TestValidator, MemoryStore>;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn new_chain(config: &NodeConfig) -> Arc<TestChain> {
        Arc::new(Blockchain::with_validator_and_store(
            config,
            test_validator(config),
            MemoryStore::new(),
        ))
    }

    /// A hand-driven peer speaking the wire protocol directly.
    struct RawPeer {
        transport: Arc<LocalTransport>,
        events: Receiver<TransportEvent>,
    }

    impl RawPeer {
        async fn start(network: &LocalNetwork, port: u16) -> Self {
            let (tx, events) = mpsc::channel(64);
            let transport = network.transport(addr(port));
            transport.start(tx).await.unwrap();
            Self { transport, events }
        }

        async fn send(&self, to: SocketAddr, message: Message) {
            self.transport
                .send_message(to, message.to_bytes())
                .await
                .unwrap();
        }

        async fn next_event(&mut self) -> TransportEvent {
            timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed")
        }

        async fn next_message(&mut self) -> Message {
            loop {
                if let TransportEvent::Message { payload, .. } = self.next_event().await {
                    return Message::from_bytes(&payload).unwrap();
                }
            }
        }

        async fn wait_disconnected(&mut self) {
            loop {
                if let TransportEvent::Disconnected(_) = self.next_event().await {
                    return;
                }
            }
        }
    }

    fn handshake(chain: &TestChain, head: &Block) -> Handshake {
        Handshake {
            version: PROTOCOL_VERSION,
            identity: Hash([42; 32]),
            genesis: chain.ledger().genesis().hash(),
            head_height: head.height(),
            head_hash: head.hash(),
        }
    }

    async fn engine_with_peer(
        config: &NodeConfig,
    ) -> (Arc<TestChain>, EngineHandle, RawPeer) {
        let network = LocalNetwork::new();
        let chain = new_chain(config);
        let (handle, _task) = SyncEngine::spawn(
            config.clone(),
            network.transport(addr(1)),
            Arc::clone(&chain),
        )
        .await
        .unwrap();
        let mut peer = RawPeer::start(&network, 2).await;
        peer.transport.connect(addr(1)).await.unwrap();
        assert!(matches!(
            peer.next_message().await,
            Message::Handshake(hs) if hs.head_hash == chain.ledger().genesis().hash()
        ));
        (chain, handle, peer)
    }

    #[tokio::test]
    async fn serves_headers_and_blocks() {
        let config = NodeConfig::dev();
        let (chain, _handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        let b1 = build_child(&genesis, 1, Vec::new());
        let b2 = build_child(&b1, 1, Vec::new());
        chain.import_block(b1.clone());
        chain.import_block(b2.clone());

        // The peer already has our head, so only answers come back.
        peer.send(addr(1), Message::Handshake(handshake(&chain, &b2)))
            .await;
        peer.send(
            addr(1),
            Message::GetHeaders {
                from: genesis.hash(),
                limit: 10,
            },
        )
        .await;
        assert_eq!(
            peer.next_message().await,
            Message::Headers(vec![*b1.header(), *b2.header()])
        );

        peer.send(addr(1), Message::GetBlocks(vec![b2.hash(), Hash([9; 32])]))
            .await;
        match peer.next_message().await {
            Message::Blocks(blocks) => assert_eq!(blocks, vec![b2]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn announced_block_is_fetched_and_imported() {
        let config = NodeConfig::dev();
        let (chain, _handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        let b1 = build_child(&genesis, 5, Vec::new());

        peer.send(addr(1), Message::Handshake(handshake(&chain, &genesis)))
            .await;
        peer.send(addr(1), Message::InvAnnounce(vec![Item::block(b1.hash())]))
            .await;
        assert_eq!(
            peer.next_message().await,
            Message::GetData(vec![Item::block(b1.hash())])
        );

        peer.send(addr(1), Message::Block(b1.clone())).await;
        let mut head = chain.ledger().subscribe();
        timeout(Duration::from_secs(2), head.wait_for(|tip| tip.hash == b1.hash()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chain.ledger().tip().height, 1);
    }

    #[tokio::test]
    async fn unknown_items_are_reported_not_found() {
        let config = NodeConfig::dev();
        let (chain, _handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        peer.send(addr(1), Message::Handshake(handshake(&chain, &genesis)))
            .await;

        let item = Item::transaction(Hash([3; 32]));
        peer.send(addr(1), Message::GetData(vec![item])).await;
        assert_eq!(peer.next_message().await, Message::NotFound(vec![item]));
    }

    #[tokio::test]
    async fn genesis_mismatch_disconnects_peer() {
        let config = NodeConfig::dev();
        let (chain, handle, mut peer) = engine_with_peer(&config).await;
        let mut hs = handshake(&chain, &chain.ledger().genesis().clone());
        hs.genesis = Hash([1; 32]);

        peer.send(addr(1), Message::Handshake(hs)).await;
        peer.wait_disconnected().await;
        assert!(
            handle
                .peers()
                .await
                .unwrap()
                .iter()
                .all(|p| p.state == PeerState::Disconnected)
        );
    }

    #[tokio::test]
    async fn unsolicited_blocks_get_peer_disconnected() {
        let config = NodeConfig::dev();
        let (chain, _handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        peer.send(addr(1), Message::Handshake(handshake(&chain, &genesis)))
            .await;

        for tag in 0..config.max_misbehavior as u8 {
            let block = build_child(&genesis, tag, Vec::new());
            peer.send(addr(1), Message::Block(block)).await;
        }
        peer.wait_disconnected().await;
        assert_eq!(chain.ledger().tip().height, 0);
    }

    #[tokio::test]
    async fn longer_chain_is_synced_from_peer() {
        let config = NodeConfig::dev();
        let (chain, handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        let mut remote = vec![build_child(&genesis, 7, Vec::new())];
        for _ in 1..3 {
            let next = build_child(remote.last().unwrap(), 7, Vec::new());
            remote.push(next);
        }
        let head = remote.last().unwrap().clone();

        peer.send(addr(1), Message::Handshake(handshake(&chain, &head)))
            .await;
        assert_eq!(
            peer.next_message().await,
            Message::GetHeaders {
                from: genesis.hash(),
                limit: config.sync_batch_size
            }
        );

        let headers = remote.iter().map(|b| *b.header()).collect();
        peer.send(addr(1), Message::Headers(headers)).await;
        let wanted: Vec<Hash> = remote.iter().map(Block::hash).collect();
        assert_eq!(peer.next_message().await, Message::GetBlocks(wanted));

        peer.send(addr(1), Message::Blocks(remote.clone())).await;
        let mut tip = chain.ledger().subscribe();
        timeout(Duration::from_secs(2), tip.wait_for(|t| t.hash == head.hash()))
            .await
            .unwrap()
            .unwrap();

        let peers = handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].head_hash, head.hash());
        assert_eq!(chain.import_block(head).result, AppendResult::Duplicate);
    }

    #[tokio::test]
    async fn locally_announced_block_reaches_peer() {
        let config = NodeConfig::dev();
        let (chain, handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        peer.send(addr(1), Message::Handshake(handshake(&chain, &genesis)))
            .await;
        // Wait until the engine has processed the handshake.
        while !handle.peers().await.unwrap()[0].state.is_ready() {
            tokio::task::yield_now().await;
        }

        let block = chain.build_block(Address::zero());
        assert!(chain.import_block(block.clone()).is_accepted());
        handle.announce(vec![Item::block(block.hash())]).await.unwrap();

        assert_eq!(
            peer.next_message().await,
            Message::InvAnnounce(vec![Item::block(block.hash())])
        );
    }

    #[tokio::test]
    async fn head_change_reaches_peers_behind() {
        let config = NodeConfig::dev();
        let (chain, handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        peer.send(addr(1), Message::Handshake(handshake(&chain, &genesis)))
            .await;
        while !handle.peers().await.unwrap()[0].state.is_ready() {
            tokio::task::yield_now().await;
        }

        // Nobody calls `announce`; the ledger's head change is enough.
        let block = chain.build_block(Address::zero());
        assert!(chain.import_block(block.clone()).is_accepted());
        assert_eq!(
            peer.next_message().await,
            Message::InvAnnounce(vec![Item::block(block.hash())])
        );

        // Announcing it again does not repeat it.
        handle.announce(vec![Item::block(block.hash())]).await.unwrap();
        handle.peers().await.unwrap();
        assert!(peer.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_head_follows_its_accepted_blocks() {
        let config = NodeConfig::dev();
        let (chain, handle, mut peer) = engine_with_peer(&config).await;
        let genesis = Arc::clone(chain.ledger().genesis());
        let b1 = build_child(&genesis, 5, Vec::new());
        peer.send(addr(1), Message::Handshake(handshake(&chain, &genesis)))
            .await;
        peer.send(addr(1), Message::InvAnnounce(vec![Item::block(b1.hash())]))
            .await;
        assert!(matches!(peer.next_message().await, Message::GetData(_)));

        peer.send(addr(1), Message::Block(b1.clone())).await;
        let mut head = chain.ledger().subscribe();
        timeout(Duration::from_secs(2), head.wait_for(|tip| tip.hash == b1.hash()))
            .await
            .unwrap()
            .unwrap();

        let peers = handle.peers().await.unwrap();
        assert_eq!(peers[0].head_height, 1);
        assert_eq!(peers[0].head_hash, b1.hash());
    }

    #[tokio::test]
    async fn peer_that_stops_reading_is_dropped() {
        let config = NodeConfig::dev();
        let (chain, handle, mut peer) = engine_with_peer(&config).await;
        let genesis = chain.ledger().genesis().hash();
        peer.send(addr(1), Message::Handshake(handshake(&chain, &chain.ledger().genesis().clone())))
            .await;

        // Every request gets an answer the peer never reads. Sends start
        // failing once the engine has dropped the connection.
        let request = Message::GetHeaders { from: genesis, limit: 1 }.to_bytes();
        for _ in 0..OUTBOX_CAPACITY + 128 {
            let _ = peer.transport.send_message(addr(1), request.clone()).await;
        }
        peer.wait_disconnected().await;
        assert!(
            handle
                .peers()
                .await
                .unwrap()
                .iter()
                .all(|p| !p.state.is_ready())
        );
    }

    #[tokio::test]
    async fn writer_survives_an_oversized_frame() {
        let network = LocalNetwork::new();
        let local = network.transport(addr(1));
        let (tx, _events) = mpsc::channel(8);
        local.start(tx).await.unwrap();
        let mut peer = RawPeer::start(&network, 2).await;
        local.connect(addr(2)).await.unwrap();

        let outbox = spawn_writer(Arc::clone(&local), addr(2));
        outbox
            .send(Bytes::from(vec![0u8; MAX_MESSAGE_BYTES + 1]))
            .await
            .unwrap();
        outbox
            .send(Message::NotFound(Vec::new()).to_bytes())
            .await
            .unwrap();
        assert_eq!(peer.next_message().await, Message::NotFound(Vec::new()));
    }

    #[tokio::test]
    async fn shutdown_stops_the_engine() {
        let config = NodeConfig::dev();
        let (_chain, handle, mut peer) = engine_with_peer(&config).await;
        handle.shutdown().await;
        peer.wait_disconnected().await;
        assert_eq!(handle.peers().await, Err(EngineStopped));
    }
}
