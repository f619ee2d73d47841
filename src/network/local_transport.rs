//! In-memory transport implementation for local testing and development.
//!
//! Transports created from one [`LocalNetwork`] can reach each other by
//! address. Frames are handed over through the receiving node's event
//! channel without any I/O.

use crate::network::message::MAX_MESSAGE_BYTES;
use crate::network::transport::{Transport, TransportError, TransportEvent};
use crate::types::bytes::Bytes;
use crate::types::wrapper_types::BoxFuture;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::Sender;

type Registry = DashMap<SocketAddr, Weak<LocalTransport>>;

/// Address book shared by a group of in-memory transports.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    nodes: Arc<Registry>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport reachable at `address` within this network.
    pub fn transport(&self, address: SocketAddr) -> Arc<LocalTransport> {
        let transport = Arc::new(LocalTransport {
            address,
            network: Arc::clone(&self.nodes),
            peers: DashMap::new(),
            events: Mutex::new(None),
        });
        self.nodes.insert(address, Arc::downgrade(&transport));
        transport
    }
}

/// In-memory transport using async channels for local message passing.
pub struct LocalTransport {
    address: SocketAddr,
    network: Arc<Registry>,
    peers: DashMap<SocketAddr, Weak<LocalTransport>>,
    events: Mutex<Option<Sender<TransportEvent>>>,
}

impl LocalTransport {
    fn events(&self) -> Option<Sender<TransportEvent>> {
        self.events.lock().clone()
    }

    fn peer(&self, addr: &SocketAddr) -> Option<Arc<LocalTransport>> {
        self.peers.get(addr).and_then(|p| p.upgrade())
    }

    fn notify(&self, event: TransportEvent) {
        if let Some(events) = self.events() {
            tokio::spawn(async move {
                let _ = events.send(event).await;
            });
        }
    }
}

impl Transport for LocalTransport {
    fn start(
        self: &Arc<Self>,
        events: Sender<TransportEvent>,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let result = {
            let mut slot = self.events.lock();
            if slot.is_some() {
                Err(TransportError::AlreadyStarted)
            } else {
                *slot = Some(events);
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn connect(self: &Arc<Self>, addr: SocketAddr) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = Arc::clone(self);

        Box::pin(async move {
            let own = this.events().ok_or(TransportError::NotStarted)?;
            if addr == this.address || this.peers.contains_key(&addr) {
                return Ok(());
            }
            let other = this
                .network
                .get(&addr)
                .and_then(|p| p.upgrade())
                .ok_or(TransportError::Unreachable(addr))?;
            let theirs = other.events().ok_or(TransportError::Unreachable(addr))?;

            this.peers.insert(addr, Arc::downgrade(&other));
            other.peers.insert(this.address, Arc::downgrade(&this));

            theirs
                .send(TransportEvent::Connected(this.address))
                .await
                .map_err(|_| TransportError::Unreachable(addr))?;
            own.send(TransportEvent::Connected(addr))
                .await
                .map_err(|_| TransportError::NotStarted)
        })
    }

    fn send_message(
        self: &Arc<Self>,
        to: SocketAddr,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let peer = self.peer(&to);
        let address = self.address;

        Box::pin(async move {
            if payload.len() > MAX_MESSAGE_BYTES {
                return Err(TransportError::FrameTooLarge {
                    to,
                    len: payload.len(),
                });
            }
            let peer = peer.ok_or(TransportError::PeerNotFound(to))?;
            let events = peer.events().ok_or(TransportError::SendFailed(to))?;
            events
                .send(TransportEvent::Message {
                    from: address,
                    payload,
                })
                .await
                .map_err(|_| TransportError::SendFailed(to))
        })
    }

    fn disconnect(self: &Arc<Self>, peer: SocketAddr) {
        let Some((_, other)) = self.peers.remove(&peer) else {
            return;
        };
        if let Some(other) = other.upgrade() {
            other.peers.remove(&self.address);
            other.notify(TransportEvent::Disconnected(self.address));
        }
        self.notify(TransportEvent::Disconnected(peer));
    }

    fn addr(self: &Arc<Self>) -> SocketAddr {
        self.address
    }

    fn peer_addrs(self: &Arc<Self>) -> Vec<SocketAddr> {
        self.peers.iter().map(|p| *p.key()).collect()
    }
}
