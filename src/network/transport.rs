//! Transport abstraction shared by the in-memory and TCP implementations.
//!
//! A transport moves opaque frames between nodes addressed by their listen
//! address and reports connection changes as [`TransportEvent`]s on the
//! channel handed to [`Transport::start`]. Framing and connection management
//! are its business; message semantics are the engine's.

use crate::types::bytes::Bytes;
use crate::types::wrapper_types::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

/// Capacity of the event channel between transports and the engine.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Peer with the specified address is not connected.
    #[error("peer not found: {0}")]
    PeerNotFound(SocketAddr),

    /// Failed to send message to the specified address.
    #[error("failed to send message to {0}")]
    SendFailed(SocketAddr),

    /// The frame exceeds the size a transport carries; the connection is fine.
    #[error("frame of {len} bytes to {to} exceeds the limit")]
    FrameTooLarge { to: SocketAddr, len: usize },

    #[error("could not reach {0}")]
    Unreachable(SocketAddr),

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport not started")]
    NotStarted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum TransportEvent {
    Connected(SocketAddr),
    Message { from: SocketAddr, payload: Bytes },
    Disconnected(SocketAddr),
}

/// Async transport layer for network communication between nodes.
///
/// For a given peer, `Connected` is delivered before any of its messages and
/// messages arrive in the order they were sent.
pub trait Transport: Send + Sync + 'static {
    /// Begins accepting connections and delivering events to `events`.
    fn start(
        self: &Arc<Self>,
        events: Sender<TransportEvent>,
    ) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Opens a connection to the node listening on `addr`.
    fn connect(self: &Arc<Self>, addr: SocketAddr) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Sends one frame to a connected peer. Frames above
    /// [`MAX_MESSAGE_BYTES`](crate::network::message::MAX_MESSAGE_BYTES) are
    /// refused with [`TransportError::FrameTooLarge`].
    fn send_message(
        self: &Arc<Self>,
        to: SocketAddr,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Closes the connection to `peer`, if any.
    fn disconnect(self: &Arc<Self>, peer: SocketAddr);

    /// Returns the local listen address.
    fn addr(self: &Arc<Self>) -> SocketAddr;

    /// Addresses of currently connected peers.
    fn peer_addrs(self: &Arc<Self>) -> Vec<SocketAddr>;
}
