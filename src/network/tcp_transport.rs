//! TCP-based transport implementation for real network communication.
//!
//! Provides length-prefixed framing over TCP with one connection per peer.
//!
//! # Framing
//!
//! Every frame is `[len: u32 LE][payload: len bytes]` with
//! `0 < len <= MAX_FRAME_BYTES`. A frame outside those bounds closes the
//! connection.
//!
//! # Connection model
//!
//! - The dialing side sends its listen address as the first frame. Peers are
//!   keyed by listen address on both ends, so the address that the engine
//!   sees is the one it can dial back.
//! - A second connection to an already connected peer is dropped.
//! - The writer is removed and `Disconnected` emitted when the read loop ends.

use crate::network::message::MAX_MESSAGE_BYTES;
use crate::network::transport::{Transport, TransportError, TransportEvent};
use crate::types::bytes::Bytes;
use crate::types::wrapper_types::BoxFuture;
use crate::{debug, warn};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::sync::mpsc::Sender;
use tokio::time::{Duration, sleep, timeout};

/// Largest accepted frame.
pub const MAX_FRAME_BYTES: usize = MAX_MESSAGE_BYTES;

const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(3);
const DIAL_ATTEMPTS: u32 = 5;
const DIAL_BACKOFF: Duration = Duration::from_millis(100);

type Writer = Arc<Mutex<OwnedWriteHalf>>;

/// TCP transport for node-to-node communication.
pub struct TcpTransport {
    /// Configured listen address; the port may be 0.
    listen_address: SocketAddr,
    /// Address actually bound, set by `start`.
    bound: OnceLock<SocketAddr>,
    /// Write halves of peer connections, keyed by peer listen address.
    writers: DashMap<SocketAddr, Writer>,
    events: OnceLock<Sender<TransportEvent>>,
}

impl TcpTransport {
    /// Creates a transport that will listen on `address` once started.
    pub fn new(address: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            listen_address: address,
            bound: OnceLock::new(),
            writers: DashMap::new(),
            events: OnceLock::new(),
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.bound.get().copied().unwrap_or(self.listen_address)
    }

    async fn write_frame(writer: &Mutex<OwnedWriteHalf>, data: &[u8]) -> io::Result<()> {
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len as usize <= MAX_FRAME_BYTES && *len > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame size out of range"))?;
        let mut guard = writer.lock().await;
        guard.write_all(&len.to_le_bytes()).await?;
        guard.write_all(data).await?;
        guard.flush().await
    }

    async fn read_frame(reader: &mut OwnedReadHalf) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame size out of range"));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        Ok(frame)
    }

    async fn read_preamble(reader: &mut OwnedReadHalf) -> io::Result<SocketAddr> {
        let frame = timeout(PREAMBLE_TIMEOUT, Self::read_frame(reader))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no preamble"))??;
        std::str::from_utf8(&frame)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid preamble"))
    }

    /// Registers a connection and runs its read loop until it closes.
    fn register(
        self: &Arc<Self>,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        events: Sender<TransportEvent>,
    ) -> BoxFuture<'static, bool> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let writer: Writer = Arc::new(Mutex::new(writer));
            match this.writers.entry(peer) {
                Entry::Occupied(_) => return false,
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&writer));
                }
            }
            if events.send(TransportEvent::Connected(peer)).await.is_err() {
                this.writers.remove(&peer);
                return false;
            }

            tokio::spawn(async move {
                Self::read_loop(peer, reader, &events).await;
                this.writers
                    .remove_if(&peer, |_, current| Arc::ptr_eq(current, &writer));
                let _ = events.send(TransportEvent::Disconnected(peer)).await;
            });
            true
        })
    }

    async fn read_loop(peer: SocketAddr, mut reader: OwnedReadHalf, events: &Sender<TransportEvent>) {
        loop {
            let frame = match Self::read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(err) => {
                    if err.kind() != io::ErrorKind::UnexpectedEof {
                        debug!("connection to {} closed: {}", peer, err);
                    }
                    return;
                }
            };
            let event = TransportEvent::Message {
                from: peer,
                payload: Bytes::from(frame),
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, events: Sender<TransportEvent>) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            let this = Arc::clone(&self);
            let events = events.clone();
            tokio::spawn(async move {
                let (mut reader, writer) = stream.into_split();
                match Self::read_preamble(&mut reader).await {
                    Ok(peer) => {
                        if !this.register(peer, reader, writer, events).await {
                            debug!("dropped duplicate connection from {}", peer);
                        }
                    }
                    Err(err) => debug!("rejected connection from {}: {}", remote, err),
                }
            });
        }
    }

    async fn dial(addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let mut delay = DIAL_BACKOFF;
        for attempt in 1..=DIAL_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) if attempt == DIAL_ATTEMPTS => {
                    debug!("giving up on {}: {}", addr, err);
                }
                Err(_) => {
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(TransportError::Unreachable(addr))
    }
}

impl Transport for TcpTransport {
    fn start(
        self: &Arc<Self>,
        events: Sender<TransportEvent>,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            if this.events.set(events.clone()).is_err() {
                return Err(TransportError::AlreadyStarted);
            }
            let listener = TcpListener::bind(this.listen_address).await?;
            let bound = listener.local_addr()?;
            let _ = this.bound.set(bound);
            tokio::spawn(Self::accept_loop(Arc::clone(&this), listener, events));
            Ok(())
        })
    }

    fn connect(self: &Arc<Self>, addr: SocketAddr) -> BoxFuture<'static, Result<(), TransportError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let events = this.events.get().cloned().ok_or(TransportError::NotStarted)?;
            if this.writers.contains_key(&addr) {
                return Ok(());
            }
            let stream = Self::dial(addr).await?;
            let mut advertised = this.local_addr();
            if advertised.ip().is_unspecified() {
                if let Ok(local) = stream.local_addr() {
                    advertised.set_ip(local.ip());
                }
            }
            let (reader, writer) = stream.into_split();
            let preamble = advertised.to_string();
            let writer_ref = Mutex::new(writer);
            Self::write_frame(&writer_ref, preamble.as_bytes()).await?;
            this.register(addr, reader, writer_ref.into_inner(), events).await;
            Ok(())
        })
    }

    fn send_message(
        self: &Arc<Self>,
        to: SocketAddr,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let writer = self.writers.get(&to).map(|w| Arc::clone(w.value()));
        Box::pin(async move {
            if payload.len() > MAX_FRAME_BYTES {
                return Err(TransportError::FrameTooLarge {
                    to,
                    len: payload.len(),
                });
            }
            let writer = writer.ok_or(TransportError::PeerNotFound(to))?;
            Self::write_frame(&writer, &payload)
                .await
                .map_err(|_| TransportError::SendFailed(to))
        })
    }

    fn disconnect(self: &Arc<Self>, peer: SocketAddr) {
        if let Some((_, writer)) = self.writers.remove(&peer) {
            tokio::spawn(async move {
                let _ = writer.lock().await.shutdown().await;
            });
        }
    }

    fn addr(self: &Arc<Self>) -> SocketAddr {
        self.local_addr()
    }

    fn peer_addrs(self: &Arc<Self>) -> Vec<SocketAddr> {
        self.writers.iter().map(|e| *e.key()).collect()
    }
}
