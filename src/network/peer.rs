//! What the node knows about each connected peer.

use crate::types::hash::Hash;
use std::fmt;
use std::net::SocketAddr;

/// Connection lifecycle of a peer.
///
/// `Connecting → Handshaking → Synced ⇄ Syncing → Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Dial in progress.
    Connecting,
    /// Connected, waiting for the peer's handshake.
    Handshaking,
    /// Handshake done, nothing to fetch.
    Synced,
    /// Downloading the peer's chain.
    Syncing,
    /// Scheduled for removal.
    Disconnected,
}

impl PeerState {
    /// Handshake completed and the connection is usable for gossip.
    pub fn is_ready(self) -> bool {
        matches!(self, PeerState::Synced | PeerState::Syncing)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Connecting => "connecting",
            PeerState::Handshaking => "handshaking",
            PeerState::Synced => "synced",
            PeerState::Syncing => "syncing",
            PeerState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Snapshot of one peer, as reported by `list_peers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: SocketAddr,
    /// Identity from the handshake; `None` until it arrives.
    pub identity: Option<Hash>,
    pub head_height: u64,
    pub head_hash: Hash,
    pub state: PeerState,
    /// Protocol violations so far.
    pub misbehavior: u32,
}

impl PeerInfo {
    pub fn new(address: SocketAddr, state: PeerState) -> Self {
        Self {
            address,
            identity: None,
            head_height: 0,
            head_hash: Hash::zero(),
            state,
            misbehavior: 0,
        }
    }
}
