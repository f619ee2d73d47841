//! Network layer for peer-to-peer communication between nodes.
//!
//! - [`transport`]: Transport trait and error types
//! - [`tcp_transport`]: Length-prefixed frames over TCP
//! - [`local_transport`]: In-memory transport for testing
//! - [`message`]: Wire protocol messages
//! - [`peer`]: Per-peer state reported to callers
//! - [`gossip`]: Announcement de-duplication and request tracking
//! - [`sync`]: Header-first sync state machine
//! - [`engine`]: Event loop driving gossip and sync

pub mod engine;
pub mod gossip;
pub mod local_transport;
pub mod message;
pub mod peer;
pub mod sync;
pub mod tcp_transport;
pub mod transport;
