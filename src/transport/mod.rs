//! Boundary between the cluster and the network.
//!
//! The cluster never touches sockets. It asks a [`Transport`] to open links to
//! peers, addresses them by the opaque [`PeerHandle`] the transport issues, and
//! receives everything the network does as [`TransportEvent`]s.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::raft::NodeId;

pub use memory::{MemoryNetwork, MemoryTransport};

/// Opaque reference to one link, issued and owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u64);

impl PeerHandle {
    pub fn new(raw: u64) -> Self {
        PeerHandle(raw)
    }
}

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// What a new member is built from: an address to dial, or a link the
/// transport already accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Address(String),
    Accepted(PeerHandle),
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Address(addr) => f.write_str(addr),
            Peer::Accepted(handle) => write!(f, "accepted {}", handle),
        }
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub handle: PeerHandle,
    /// Identity reported by the remote side, if the transport knows it.
    pub id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer opened a link to us.
    Connected(PeerHandle),
    /// A link was closed by the remote side or the network.
    Disconnected(PeerHandle),
    Data { peer: PeerHandle, payload: Vec<u8> },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no listener at address {0}")]
    UnknownAddress(String),

    #[error("connection to {0} refused")]
    Refused(String),

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("transport is not listening")]
    NotListening,

    #[error("{0} is closed")]
    Closed(PeerHandle),
}

/// Network operations the cluster consumes.
///
/// Links are ordered and reliable: payloads sent on one handle arrive in order,
/// and a [`TransportEvent::Connected`] for a handle is delivered before any data
/// on it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of this endpoint, if the transport assigns one.
    fn local_id(&self) -> Option<NodeId>;

    /// Start listening. Events for every link end up on `events`.
    async fn start(&self, events: EventSender) -> Result<(), TransportError>;

    async fn connect(&self, peer: &Peer) -> Result<Connection, TransportError>;

    async fn send(&self, peer: PeerHandle, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close a link. Closing an unknown or already closed link succeeds.
    async fn disconnect(&self, peer: PeerHandle) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;
}
