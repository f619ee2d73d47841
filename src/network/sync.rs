//! Per-peer synchronization state machine.
//!
//! Sync is header-first:
//! 1. Both sides exchange a [`Handshake`]. A peer on another genesis or
//!    protocol revision is dropped.
//! 2. If the peer's head is unknown and beats the local head, request the
//!    headers following the local head (`GetHeaders`).
//! 3. Check that the headers form a contiguous chain hanging off a known
//!    block, then fetch the missing bodies (`GetBlocks`).
//! 4. After the bodies are imported, continue from the last header until the
//!    peer answers with no headers or its head becomes known.
//!
//! The manager performs no I/O. It is fed events and returns
//! [`SyncAction`]s for the engine to execute. Fork choice stays with the
//! ledger: sync only moves blocks.

use crate::config::NodeConfig;
use crate::core::block::{Block, Header};
use crate::core::ledger::{ChainTip, Ledger, is_better_tip};
use crate::core::validator::Validator;
use crate::network::message::{Handshake, Message, PROTOCOL_VERSION, blocks_per_message};
use crate::network::peer::{PeerInfo, PeerState};
use crate::storage::storage_trait::BlockStore;
use crate::types::hash::Hash;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// What the state machine needs to know about the local chain.
pub trait LocalChain {
    fn tip(&self) -> ChainTip;
    fn genesis_hash(&self) -> Hash;
    /// Whether the block is attached to the local tree.
    fn has_block(&self, hash: &Hash) -> bool;
}

impl<V: Validator, S: BlockStore> LocalChain for Ledger<V, S> {
    fn tip(&self) -> ChainTip {
        Ledger::tip(self)
    }

    fn genesis_hash(&self) -> Hash {
        self.genesis().hash()
    }

    fn has_block(&self, hash: &Hash) -> bool {
        self.get_block(hash).is_some()
    }
}

/// Timers and limits of the state machine.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub batch_size: u32,
    /// Bodies asked for in one `GetBlocks`, so the answer fits in a message.
    pub bodies_per_request: usize,
    pub batch_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_misbehavior: u32,
    pub handshake_timeout: Duration,
}

impl From<&NodeConfig> for SyncSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            batch_size: config.sync_batch_size.max(1),
            bodies_per_request: (config.sync_batch_size.max(1) as usize)
                .min(blocks_per_message(config.chain.max_block_bytes)),
            batch_timeout: config.sync_batch_timeout,
            max_attempts: config.max_sync_attempts.max(1),
            retry_backoff: config.retry_backoff,
            max_misbehavior: config.max_misbehavior.max(1),
            handshake_timeout: config.handshake_timeout,
        }
    }
}

/// Actions the sync manager requests the engine to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Send { peer: SocketAddr, message: Message },
    Disconnect { peer: SocketAddr, reason: String },
}

/// Protocol violations detected while syncing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("unsolicited {0}")]
    Unsolicited(&'static str),

    #[error("invalid header chain: {0}")]
    InvalidHeaderChain(String),

    #[error("block {0:?} was not requested")]
    UnrequestedBlock(Hash),

    #[error("unexpected handshake")]
    UnexpectedHandshake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Headers { from: Hash },
    Blocks { hashes: Vec<Hash> },
}

impl Request {
    fn to_message(&self, limit: u32) -> Message {
        match self {
            Request::Headers { from } => Message::GetHeaders { from: *from, limit },
            Request::Blocks { hashes } => Message::GetBlocks(hashes.clone()),
        }
    }
}

struct Session {
    /// Hash the next `GetHeaders` continues from.
    cursor: Hash,
    /// Missing bodies of the current header batch not requested yet.
    queued: Vec<Hash>,
    /// Request awaiting an answer and when it was sent.
    outstanding: Option<(Request, Instant)>,
    /// Timed out request and when to send it again.
    retry: Option<(Request, Instant)>,
    /// Timed out request whose late answer is ignored.
    expired: Option<Request>,
    /// Consecutive timeouts of the current batch.
    attempts: u32,
    /// Rounds that made no progress.
    stalls: u32,
}

impl Session {
    fn new(cursor: Hash) -> Self {
        Self {
            cursor,
            queued: Vec::new(),
            outstanding: None,
            retry: None,
            expired: None,
            attempts: 0,
            stalls: 0,
        }
    }
}

struct PeerEntry {
    info: PeerInfo,
    /// When the peer entered its current connection state.
    since: Instant,
    session: Option<Session>,
}

/// Manages the handshake and sync state of every peer.
pub struct SyncManager {
    settings: SyncSettings,
    identity: Hash,
    peers: HashMap<SocketAddr, PeerEntry>,
}

impl SyncManager {
    /// `identity` is the local node identity; a peer presenting it is ourselves.
    pub fn new(settings: SyncSettings, identity: Hash) -> Self {
        Self {
            settings,
            identity,
            peers: HashMap::new(),
        }
    }

    /// The handshake this node sends.
    pub fn handshake(&self, chain: &dyn LocalChain) -> Handshake {
        let tip = chain.tip();
        Handshake {
            version: PROTOCOL_VERSION,
            identity: self.identity,
            genesis: chain.genesis_hash(),
            head_height: tip.height,
            head_hash: tip.hash,
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|p| p.info.clone()).collect()
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&PeerInfo> {
        self.peers.get(addr).map(|p| &p.info)
    }

    /// Peers that completed the handshake.
    pub fn ready_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|(_, p)| p.info.state.is_ready())
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn is_ready(&self, addr: &SocketAddr) -> bool {
        self.peers
            .get(addr)
            .is_some_and(|p| p.info.state.is_ready())
    }

    /// A dial to `addr` was started.
    pub fn on_dialing(&mut self, addr: SocketAddr, now: Instant) {
        self.peers.entry(addr).or_insert_with(|| PeerEntry {
            info: PeerInfo::new(addr, PeerState::Connecting),
            since: now,
            session: None,
        });
    }

    pub fn on_dial_failed(&mut self, addr: SocketAddr) {
        if self
            .peers
            .get(&addr)
            .is_some_and(|p| p.info.state == PeerState::Connecting)
        {
            self.peers.remove(&addr);
        }
    }

    /// A connection is up. Returns `true` if the handshake should be sent,
    /// which happens once per connection.
    pub fn on_connected(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.get_mut(&addr) {
            Some(peer)
                if !matches!(
                    peer.info.state,
                    PeerState::Connecting | PeerState::Disconnected
                ) =>
            {
                false
            }
            _ => {
                self.peers.insert(
                    addr,
                    PeerEntry {
                        info: PeerInfo::new(addr, PeerState::Handshaking),
                        since: now,
                        session: None,
                    },
                );
                true
            }
        }
    }

    pub fn on_disconnected(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.info.state = PeerState::Disconnected;
            peer.session = None;
        }
    }

    /// Handles the peer's handshake.
    pub fn on_handshake(
        &mut self,
        addr: SocketAddr,
        handshake: Handshake,
        chain: &dyn LocalChain,
        now: Instant,
    ) -> Vec<SyncAction> {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Vec::new();
        };
        if peer.info.state != PeerState::Handshaking {
            return self.penalize(addr, &SyncError::UnexpectedHandshake.to_string());
        }

        let reason = if handshake.version != PROTOCOL_VERSION {
            Some(format!("protocol version {}", handshake.version))
        } else if handshake.genesis != chain.genesis_hash() {
            Some(format!("genesis mismatch ({})", handshake.genesis.short()))
        } else if handshake.identity == self.identity {
            Some("connected to self".to_string())
        } else {
            None
        };
        if let Some(reason) = reason {
            peer.info.state = PeerState::Disconnected;
            return vec![SyncAction::Disconnect { peer: addr, reason }];
        }

        peer.info.identity = Some(handshake.identity);
        peer.info.head_height = handshake.head_height;
        peer.info.head_hash = handshake.head_hash;
        peer.info.state = PeerState::Synced;
        peer.since = now;

        if !chain.has_block(&handshake.head_hash) {
            let local = chain.tip();
            if is_better_tip(
                handshake.head_height,
                &handshake.head_hash,
                local.height,
                &local.hash,
            ) {
                return self.start_session(addr, chain, now);
            }
        }
        Vec::new()
    }

    /// A block from `addr` turned out to be an orphan: the peer has history
    /// we lack, so sync with it unless already doing so.
    pub fn on_orphan(
        &mut self,
        addr: SocketAddr,
        chain: &dyn LocalChain,
        now: Instant,
    ) -> Vec<SyncAction> {
        match self.peers.get(&addr) {
            Some(peer) if peer.info.state == PeerState::Synced => {
                self.start_session(addr, chain, now)
            }
            _ => Vec::new(),
        }
    }

    /// Handles a `Headers` answer.
    pub fn on_headers(
        &mut self,
        addr: SocketAddr,
        headers: &[Header],
        chain: &dyn LocalChain,
        now: Instant,
    ) -> Result<Vec<SyncAction>, SyncError> {
        let batch_size = self.settings.batch_size;
        let bodies_per_request = self.settings.bodies_per_request;
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Err(SyncError::Unsolicited("headers"));
        };
        let Some(session) = peer.session.as_mut() else {
            return Err(SyncError::Unsolicited("headers"));
        };
        match session.outstanding.take() {
            Some((Request::Headers { .. }, _)) => {}
            other => {
                session.outstanding = other;
                if matches!(session.expired, Some(Request::Headers { .. })) {
                    session.expired = None;
                    return Ok(Vec::new());
                }
                return Err(SyncError::Unsolicited("headers"));
            }
        }
        session.attempts = 0;

        if headers.is_empty() {
            Self::finish(peer);
            return Ok(Vec::new());
        }

        let last = match validate_header_chain(headers, batch_size as usize, chain) {
            Ok(last) => last,
            Err(err) => {
                Self::finish(peer);
                return Err(err);
            }
        };
        if is_better_tip(
            last.height,
            &last.hash(),
            peer.info.head_height,
            &peer.info.head_hash,
        ) {
            peer.info.head_height = last.height;
            peer.info.head_hash = last.hash();
        }
        session.cursor = last.hash();

        let mut missing: Vec<Hash> = headers
            .iter()
            .map(Header::hash)
            .filter(|hash| !chain.has_block(hash))
            .collect();
        let request = if missing.is_empty() {
            Request::Headers {
                from: session.cursor,
            }
        } else {
            session.queued = missing.split_off(missing.len().min(bodies_per_request));
            Request::Blocks { hashes: missing }
        };
        Ok(vec![Self::send(addr, session, request, batch_size, now)])
    }

    /// Handles a `Blocks` answer. Returns the blocks in height order for the
    /// engine to import; afterwards it must call [`SyncManager::after_import`].
    pub fn on_blocks(&mut self, addr: SocketAddr, blocks: Vec<Block>) -> Result<Vec<Block>, SyncError> {
        let Some(session) = self.peers.get_mut(&addr).and_then(|p| p.session.as_mut()) else {
            return Err(SyncError::Unsolicited("blocks"));
        };
        let requested = match session.outstanding.take() {
            Some((Request::Blocks { hashes }, _)) => hashes,
            other => {
                session.outstanding = other;
                if matches!(session.expired, Some(Request::Blocks { .. })) {
                    session.expired = None;
                    return Ok(Vec::new());
                }
                return Err(SyncError::Unsolicited("blocks"));
            }
        };
        session.attempts = 0;

        let requested: HashSet<Hash> = requested.into_iter().collect();
        if let Some(extra) = blocks.iter().find(|b| !requested.contains(&b.hash())) {
            let hash = extra.hash();
            if let Some(peer) = self.peers.get_mut(&addr) {
                Self::finish(peer);
            }
            return Err(SyncError::UnrequestedBlock(hash));
        }

        let mut blocks = blocks;
        blocks.sort_by_key(Block::height);
        Ok(blocks)
    }

    /// Continues a session once the last batch of bodies was imported.
    pub fn after_import(
        &mut self,
        addr: SocketAddr,
        chain: &dyn LocalChain,
        now: Instant,
    ) -> Vec<SyncAction> {
        let settings = self.settings;
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Vec::new();
        };
        let head_known = chain.has_block(&peer.info.head_hash);
        let Some(session) = peer.session.as_mut() else {
            return Vec::new();
        };
        if session.outstanding.is_some() || session.retry.is_some() {
            return Vec::new();
        }
        if head_known {
            Self::finish(peer);
            return Vec::new();
        }
        if !session.queued.is_empty() {
            let rest = session
                .queued
                .split_off(session.queued.len().min(settings.bodies_per_request));
            let hashes = std::mem::replace(&mut session.queued, rest);
            let request = Request::Blocks { hashes };
            return vec![Self::send(addr, session, request, settings.batch_size, now)];
        }

        if !chain.has_block(&session.cursor) {
            // Some bodies never arrived; restart from the local head.
            session.stalls += 1;
            session.cursor = chain.tip().hash;
            if session.stalls > settings.max_attempts {
                Self::finish(peer);
                return self.penalize(addr, "sync made no progress");
            }
        }
        let request = Request::Headers {
            from: session.cursor,
        };
        vec![Self::send(addr, session, request, settings.batch_size, now)]
    }

    /// Records that the peer has `hash` at `height`, when that beats what it
    /// last told us.
    pub fn note_peer_head(&mut self, addr: SocketAddr, height: u64, hash: Hash) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if is_better_tip(height, &hash, peer.info.head_height, &peer.info.head_hash) {
            peer.info.head_height = height;
            peer.info.head_hash = hash;
        }
    }

    /// Counts a protocol violation. The peer is disconnected once the count
    /// reaches the configured limit.
    pub fn penalize(&mut self, addr: SocketAddr, reason: &str) -> Vec<SyncAction> {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Vec::new();
        };
        peer.info.misbehavior += 1;
        if peer.info.misbehavior >= self.settings.max_misbehavior {
            return self.disconnect(addr, &format!("misbehaving: {}", reason));
        }
        Vec::new()
    }

    /// Drops a peer that is not already disconnected.
    pub fn disconnect(&mut self, addr: SocketAddr, reason: &str) -> Vec<SyncAction> {
        match self.peers.get_mut(&addr) {
            Some(peer) if peer.info.state != PeerState::Disconnected => {
                peer.info.state = PeerState::Disconnected;
                peer.session = None;
                vec![SyncAction::Disconnect {
                    peer: addr,
                    reason: reason.to_string(),
                }]
            }
            _ => Vec::new(),
        }
    }

    /// Periodic maintenance: handshake timeouts, batch timeouts and retries,
    /// removal of disconnected peers.
    pub fn tick(&mut self, now: Instant) -> Vec<SyncAction> {
        let settings = self.settings;
        let mut actions = Vec::new();

        self.peers
            .retain(|_, peer| peer.info.state != PeerState::Disconnected);

        for (addr, peer) in self.peers.iter_mut() {
            let addr = *addr;
            if matches!(
                peer.info.state,
                PeerState::Connecting | PeerState::Handshaking
            ) && now.saturating_duration_since(peer.since) >= settings.handshake_timeout
            {
                peer.info.state = PeerState::Disconnected;
                actions.push(SyncAction::Disconnect {
                    peer: addr,
                    reason: "handshake timeout".to_string(),
                });
                continue;
            }

            let Some(session) = peer.session.as_mut() else {
                continue;
            };

            if let Some((request, sent)) = session.outstanding.take() {
                if now.saturating_duration_since(sent) < settings.batch_timeout {
                    session.outstanding = Some((request, sent));
                } else {
                    session.attempts += 1;
                    if session.attempts >= settings.max_attempts {
                        peer.info.state = PeerState::Disconnected;
                        peer.session = None;
                        actions.push(SyncAction::Disconnect {
                            peer: addr,
                            reason: "sync batch timed out".to_string(),
                        });
                        continue;
                    }
                    let backoff = settings.retry_backoff * 2u32.saturating_pow(session.attempts - 1);
                    session.expired = Some(request.clone());
                    session.retry = Some((request, now + backoff));
                }
            }

            if let Some((_, due)) = &session.retry {
                if *due <= now {
                    if let Some((request, _)) = session.retry.take() {
                        actions.push(Self::send(addr, session, request, settings.batch_size, now));
                    }
                }
            }
        }
        actions
    }

    fn start_session(
        &mut self,
        addr: SocketAddr,
        chain: &dyn LocalChain,
        now: Instant,
    ) -> Vec<SyncAction> {
        let batch_size = self.settings.batch_size;
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Vec::new();
        };
        peer.info.state = PeerState::Syncing;
        let session = peer.session.insert(Session::new(chain.tip().hash));
        let request = Request::Headers {
            from: session.cursor,
        };
        vec![Self::send(addr, session, request, batch_size, now)]
    }

    fn send(
        addr: SocketAddr,
        session: &mut Session,
        request: Request,
        batch_size: u32,
        now: Instant,
    ) -> SyncAction {
        let message = request.to_message(batch_size);
        session.outstanding = Some((request, now));
        SyncAction::Send {
            peer: addr,
            message,
        }
    }

    fn finish(peer: &mut PeerEntry) {
        peer.session = None;
        if peer.info.state == PeerState::Syncing {
            peer.info.state = PeerState::Synced;
        }
    }
}

/// Checks that `headers` are contiguous and hang off a known block.
/// Returns the last header.
fn validate_header_chain<'a>(
    headers: &'a [Header],
    max: usize,
    chain: &dyn LocalChain,
) -> Result<&'a Header, SyncError> {
    if headers.len() > max {
        return Err(SyncError::InvalidHeaderChain(format!(
            "{} headers, at most {} requested",
            headers.len(),
            max
        )));
    }
    let Some(first) = headers.first() else {
        return Err(SyncError::InvalidHeaderChain("empty headers".into()));
    };
    if !chain.has_block(&first.previous_block) {
        return Err(SyncError::InvalidHeaderChain(format!(
            "first header links to unknown block {}",
            first.previous_block.short()
        )));
    }

    let mut prev = first;
    for header in &headers[1..] {
        if prev.height.checked_add(1) != Some(header.height) {
            return Err(SyncError::InvalidHeaderChain(format!(
                "non-contiguous height: {} follows {}",
                header.height, prev.height
            )));
        }
        if header.previous_block != prev.hash() {
            return Err(SyncError::InvalidHeaderChain(
                "header previous_block mismatch".into(),
            ));
        }
        prev = header;
    }
    Ok(prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;
    use crate::types::address::Address;

    struct FakeChain {
        blocks: HashMap<Hash, Block>,
        genesis: Hash,
        tip: ChainTip,
    }

    impl FakeChain {
        fn new() -> Self {
            let genesis = Block::genesis(&ChainParams::default());
            let tip = ChainTip {
                hash: genesis.hash(),
                height: 0,
            };
            let mut blocks = HashMap::new();
            blocks.insert(genesis.hash(), genesis.clone());
            Self {
                blocks,
                genesis: genesis.hash(),
                tip,
            }
        }

        fn add(&mut self, block: &Block) {
            self.blocks.insert(block.hash(), block.clone());
            if block.height() > self.tip.height {
                self.tip = ChainTip {
                    hash: block.hash(),
                    height: block.height(),
                };
            }
        }

        fn genesis_block(&self) -> Block {
            self.blocks[&self.genesis].clone()
        }
    }

    impl LocalChain for FakeChain {
        fn tip(&self) -> ChainTip {
            self.tip
        }

        fn genesis_hash(&self) -> Hash {
            self.genesis
        }

        fn has_block(&self, hash: &Hash) -> bool {
            self.blocks.contains_key(hash)
        }
    }

    fn extend(from: &Block, count: usize) -> Vec<Block> {
        let mut out: Vec<Block> = Vec::with_capacity(count);
        for _ in 0..count {
            let parent = out.last().unwrap_or(from);
            let ts = parent.header().timestamp + 1_000;
            let block = Block::new(parent, Address([9; 20]), Vec::new(), ts);
            out.push(block);
        }
        out
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            batch_size: 4,
            bodies_per_request: 4,
            batch_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            max_misbehavior: 3,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 6001))
    }

    fn identity(n: u8) -> Hash {
        Hash([n; 32])
    }

    fn handshake_for(chain: &FakeChain, head: &Block) -> Handshake {
        Handshake {
            version: PROTOCOL_VERSION,
            identity: identity(2),
            genesis: chain.genesis_hash(),
            head_height: head.height(),
            head_hash: head.hash(),
        }
    }

    fn connected(manager: &mut SyncManager, now: Instant) {
        assert!(manager.on_connected(peer(), now));
    }

    fn sent(actions: &[SyncAction]) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                SyncAction::Send { message, .. } => Some(message),
                SyncAction::Disconnect { .. } => None,
            })
            .collect()
    }

    fn disconnects(actions: &[SyncAction]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, SyncAction::Disconnect { .. }))
    }

    // ==================== Handshake Tests ====================

    #[test]
    fn handshake_with_known_head_is_synced() {
        let chain = FakeChain::new();
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);

        let actions = manager.on_handshake(peer(), handshake_for(&chain, &chain.genesis_block()), &chain, now);

        assert!(actions.is_empty());
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Synced);
        assert_eq!(manager.peer(&peer()).unwrap().identity, Some(identity(2)));
    }

    #[test]
    fn handshake_with_better_unknown_head_starts_sync() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 3);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);

        let actions = manager.on_handshake(peer(), handshake_for(&chain, &remote[2]), &chain, now);

        assert_eq!(
            sent(&actions),
            vec![&Message::GetHeaders {
                from: chain.genesis,
                limit: 4
            }]
        );
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Syncing);
    }

    #[test]
    fn genesis_mismatch_disconnects() {
        let chain = FakeChain::new();
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        let mut hs = handshake_for(&chain, &chain.genesis_block());
        hs.genesis = Hash([7; 32]);

        let actions = manager.on_handshake(peer(), hs, &chain, now);
        assert!(disconnects(&actions));
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Disconnected);
    }

    #[test]
    fn own_identity_disconnects() {
        let chain = FakeChain::new();
        let mut manager = SyncManager::new(settings(), identity(2));
        let now = Instant::now();
        connected(&mut manager, now);

        let actions = manager.on_handshake(peer(), handshake_for(&chain, &chain.genesis_block()), &chain, now);
        assert!(disconnects(&actions));
    }

    #[test]
    fn repeated_handshake_is_penalized() {
        let chain = FakeChain::new();
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        let hs = handshake_for(&chain, &chain.genesis_block());

        manager.on_handshake(peer(), hs.clone(), &chain, now);
        manager.on_handshake(peer(), hs, &chain, now);
        assert_eq!(manager.peer(&peer()).unwrap().misbehavior, 1);
    }

    #[test]
    fn connected_once_per_connection() {
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        manager.on_dialing(peer(), now);
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Connecting);
        assert!(manager.on_connected(peer(), now));
        assert!(!manager.on_connected(peer(), now));
    }

    // ==================== Header-first Tests ====================

    #[test]
    fn full_sync_round_trip() {
        let mut chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 6);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[5]), &chain, now);

        // First batch of four headers.
        let headers: Vec<Header> = remote[..4].iter().map(|b| *b.header()).collect();
        let actions = manager.on_headers(peer(), &headers, &chain, now).unwrap();
        let wanted: Vec<Hash> = remote[..4].iter().map(Block::hash).collect();
        assert_eq!(sent(&actions), vec![&Message::GetBlocks(wanted)]);

        // Bodies arrive out of order and come back sorted.
        let mut bodies = remote[..4].to_vec();
        bodies.reverse();
        let ordered = manager.on_blocks(peer(), bodies).unwrap();
        assert_eq!(ordered.iter().map(Block::height).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        for block in &ordered {
            chain.add(block);
        }

        let actions = manager.after_import(peer(), &chain, now);
        assert_eq!(
            sent(&actions),
            vec![&Message::GetHeaders {
                from: remote[3].hash(),
                limit: 4
            }]
        );

        // Second batch completes the chain.
        let headers: Vec<Header> = remote[4..].iter().map(|b| *b.header()).collect();
        manager.on_headers(peer(), &headers, &chain, now).unwrap();
        let ordered = manager.on_blocks(peer(), remote[4..].to_vec()).unwrap();
        for block in &ordered {
            chain.add(block);
        }
        assert!(manager.after_import(peer(), &chain, now).is_empty());
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Synced);
    }

    #[test]
    fn bodies_are_fetched_in_bounded_requests() {
        let mut chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 5);
        let mut manager = SyncManager::new(
            SyncSettings {
                bodies_per_request: 2,
                ..settings()
            },
            identity(1),
        );
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[4]), &chain, now);

        let headers: Vec<Header> = remote[..4].iter().map(|b| *b.header()).collect();
        let actions = manager.on_headers(peer(), &headers, &chain, now).unwrap();
        assert_eq!(
            sent(&actions),
            vec![&Message::GetBlocks(vec![remote[0].hash(), remote[1].hash()])]
        );
        for block in manager.on_blocks(peer(), remote[..2].to_vec()).unwrap() {
            chain.add(&block);
        }

        // The rest of the batch comes before the next headers.
        let actions = manager.after_import(peer(), &chain, now);
        assert_eq!(
            sent(&actions),
            vec![&Message::GetBlocks(vec![remote[2].hash(), remote[3].hash()])]
        );
        for block in manager.on_blocks(peer(), remote[2..4].to_vec()).unwrap() {
            chain.add(&block);
        }
        let actions = manager.after_import(peer(), &chain, now);
        assert_eq!(
            sent(&actions),
            vec![&Message::GetHeaders {
                from: remote[3].hash(),
                limit: 4
            }]
        );
    }

    #[test]
    fn bodies_per_request_follows_block_size() {
        let config = NodeConfig::default();
        let settings = SyncSettings::from(&config);
        assert_eq!(settings.batch_size, 128);
        assert_eq!(
            settings.bodies_per_request,
            blocks_per_message(config.chain.max_block_bytes)
        );
        assert!(settings.bodies_per_request < 128);
    }

    #[test]
    fn header_height_overflow_is_rejected() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 2);
        let mut first = *remote[0].header();
        first.height = u64::MAX;
        let mut second = *remote[1].header();
        second.previous_block = first.hash();
        second.height = 0;

        assert!(matches!(
            validate_header_chain(&[first, second], 4, &chain),
            Err(SyncError::InvalidHeaderChain(_))
        ));
    }

    #[test]
    fn peer_head_only_moves_forward() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 3);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[1]), &chain, now);

        manager.note_peer_head(peer(), 1, remote[0].hash());
        assert_eq!(manager.peer(&peer()).unwrap().head_hash, remote[1].hash());
        manager.note_peer_head(peer(), 3, remote[2].hash());
        assert_eq!(manager.peer(&peer()).unwrap().head_height, 3);
        assert_eq!(manager.peer(&peer()).unwrap().head_hash, remote[2].hash());
    }

    #[test]
    fn disconnect_happens_once() {
        let chain = FakeChain::new();
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &chain.genesis_block()), &chain, now);

        assert!(disconnects(&manager.disconnect(peer(), "outbox full")));
        assert!(manager.disconnect(peer(), "outbox full").is_empty());
        assert!(!manager.is_ready(&peer()));
    }

    #[test]
    fn empty_headers_end_the_session() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 1);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[0]), &chain, now);

        let actions = manager.on_headers(peer(), &[], &chain, now).unwrap();
        assert!(actions.is_empty());
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Synced);
    }

    #[test]
    fn only_missing_bodies_are_requested() {
        let mut chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 3);
        chain.add(&remote[0]);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[2]), &chain, now);

        let headers: Vec<Header> = remote.iter().map(|b| *b.header()).collect();
        let actions = manager.on_headers(peer(), &headers, &chain, now).unwrap();
        assert_eq!(
            sent(&actions),
            vec![&Message::GetBlocks(vec![remote[1].hash(), remote[2].hash()])]
        );
    }

    #[test]
    fn broken_header_chain_is_an_error() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 3);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[2]), &chain, now);

        // Gap between the first and the second header.
        let headers = [*remote[0].header(), *remote[2].header()];
        let err = manager.on_headers(peer(), &headers, &chain, now).unwrap_err();
        assert!(matches!(err, SyncError::InvalidHeaderChain(_)));
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Synced);
    }

    #[test]
    fn headers_not_linked_to_known_block_are_rejected() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 3);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[2]), &chain, now);

        let headers = [*remote[1].header(), *remote[2].header()];
        assert!(manager.on_headers(peer(), &headers, &chain, now).is_err());
    }

    #[test]
    fn unsolicited_answers_are_errors() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 1);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &chain.genesis_block()), &chain, now);

        assert_eq!(
            manager.on_headers(peer(), &[*remote[0].header()], &chain, now),
            Err(SyncError::Unsolicited("headers"))
        );
        assert_eq!(
            manager.on_blocks(peer(), remote.clone()),
            Err(SyncError::Unsolicited("blocks"))
        );
    }

    #[test]
    fn unrequested_block_is_an_error() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 2);
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[1]), &chain, now);
        manager
            .on_headers(peer(), &[*remote[0].header()], &chain, now)
            .unwrap();

        assert_eq!(
            manager.on_blocks(peer(), vec![remote[1].clone()]),
            Err(SyncError::UnrequestedBlock(remote[1].hash()))
        );
    }

    #[test]
    fn orphan_starts_sync_with_synced_peer() {
        let chain = FakeChain::new();
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &chain.genesis_block()), &chain, now);

        let actions = manager.on_orphan(peer(), &chain, now);
        assert_eq!(sent(&actions).len(), 1);
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Syncing);
        // Already syncing: no second request.
        assert!(manager.on_orphan(peer(), &chain, now).is_empty());
    }

    // ==================== Timeout Tests ====================

    #[test]
    fn timed_out_batch_is_retried_with_backoff() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 2);
        let mut manager = SyncManager::new(settings(), identity(1));
        let start = Instant::now();
        connected(&mut manager, start);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[1]), &chain, start);

        // Timeout: nothing is re-sent before the backoff elapses.
        let t1 = start + Duration::from_secs(10);
        assert!(manager.tick(t1).is_empty());
        let actions = manager.tick(t1 + Duration::from_millis(500));
        assert_eq!(
            sent(&actions),
            vec![&Message::GetHeaders {
                from: chain.genesis,
                limit: 4
            }]
        );

        // The answer is matched against the retried request.
        let headers = [*remote[0].header()];
        let actions = manager
            .on_headers(peer(), &headers, &chain, t1 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(sent(&actions).len(), 1);
    }

    #[test]
    fn repeated_timeouts_disconnect() {
        let chain = FakeChain::new();
        let remote = extend(&chain.genesis_block(), 2);
        let mut manager = SyncManager::new(settings(), identity(1));
        let mut now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &remote[1]), &chain, now);

        let mut disconnected = false;
        for _ in 0..20 {
            now += Duration::from_secs(11);
            if disconnects(&manager.tick(now)) {
                disconnected = true;
                break;
            }
        }
        assert!(disconnected);
        assert_eq!(manager.peer(&peer()).unwrap().state, PeerState::Disconnected);

        // The next sweep forgets the peer.
        manager.tick(now);
        assert!(manager.peer(&peer()).is_none());
    }

    #[test]
    fn handshake_timeout_disconnects() {
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);

        assert!(manager.tick(now + Duration::from_secs(1)).is_empty());
        assert!(disconnects(&manager.tick(now + Duration::from_secs(5))));
    }

    // ==================== Misbehavior Tests ====================

    #[test]
    fn misbehavior_limit_disconnects() {
        let chain = FakeChain::new();
        let mut manager = SyncManager::new(settings(), identity(1));
        let now = Instant::now();
        connected(&mut manager, now);
        manager.on_handshake(peer(), handshake_for(&chain, &chain.genesis_block()), &chain, now);

        assert!(manager.penalize(peer(), "bad block").is_empty());
        assert!(manager.penalize(peer(), "bad block").is_empty());
        assert!(disconnects(&manager.penalize(peer(), "bad block")));
        assert!(manager.ready_peers().is_empty());
    }
}
