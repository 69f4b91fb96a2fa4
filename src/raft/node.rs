use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ClusterError, Result};
use crate::raft::rpc::Rpc;
use crate::raft::state::{NodeId, NodeState};
use crate::transport::{Connection, Peer, PeerHandle, Transport, TransportError};

/// Work for a node's writer task, processed strictly in order.
#[derive(Debug)]
enum Outbound {
    Message(Vec<u8>),
    Disconnect,
}

/// Local representative of one remote peer.
///
/// The node owns the link lifecycle (`INITIAL → DISCOVERY → CONNECTED → DEAD`)
/// and an ordered outbound queue drained by a writer task, so sends never
/// block the cluster's event loop and never overtake each other. The cluster
/// owns its nodes; a node only knows the transport.
pub struct RaftNode {
    id: NodeId,
    peer: Peer,
    handle: Option<PeerHandle>,
    state: NodeState,
    transport: Arc<dyn Transport>,
    outbox: Option<mpsc::UnboundedSender<Outbound>>,
    subscribed: bool,
    backlog: Vec<Vec<u8>>,
}

impl RaftNode {
    pub fn new(peer: Peer, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: NodeId::generate(),
            peer,
            handle: None,
            state: NodeState::Initial,
            transport,
            outbox: None,
            subscribed: false,
            backlog: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn handle(&self) -> Option<PeerHandle> {
        self.handle
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == NodeState::Connected
    }

    /// True if inbound traffic on `handle` belongs to this node.
    pub fn is_bound_to(&self, handle: PeerHandle) -> bool {
        self.link() == Some(handle)
    }

    /// Ask the transport to connect. The returned future owns everything it
    /// needs, so it can be spawned; feed its output to [`RaftNode::complete_setup`].
    pub fn setup(
        &self,
    ) -> impl Future<Output = std::result::Result<Connection, TransportError>> + Send + 'static {
        let transport = self.transport.clone();
        let peer = self.peer.clone();
        let id = self.id;
        let dead = self.state == NodeState::Dead;
        async move {
            if dead {
                tracing::debug!(node = %id, "Setup requested on a dead node");
                return Err(TransportError::NotListening);
            }
            transport.connect(&peer).await
        }
    }

    /// Apply the outcome of [`RaftNode::setup`].
    ///
    /// On success the node enters DISCOVERY and adopts the identity reported
    /// by the transport. On failure it enters DEAD and the error is returned.
    pub fn complete_setup(
        &mut self,
        outcome: std::result::Result<Connection, TransportError>,
    ) -> Result<()> {
        let conn = match outcome {
            Ok(conn) => conn,
            Err(e) => {
                if self.state != NodeState::Dead {
                    self.change_state(NodeState::Dead);
                }
                return Err(e.into());
            }
        };

        // Killed while the connect was in flight; the new link has no owner.
        if self.state == NodeState::Dead {
            self.spawn_disconnect(conn.handle);
            return Err(ClusterError::NodeDead(self.id));
        }

        self.handle = Some(conn.handle);
        if let Some(id) = conn.id {
            self.id = id;
        }
        self.outbox = Some(spawn_writer(self.transport.clone(), conn.handle, self.id));
        self.change_state(NodeState::Discovery);
        Ok(())
    }

    /// Move to `next`. Returns false (and logs) if the transition is not allowed.
    pub fn change_state(&mut self, next: NodeState) -> bool {
        if self.state == next {
            tracing::warn!(node = %self.id, state = %next, "Node is already in this state");
            return false;
        }
        if self.state == NodeState::Dead {
            tracing::warn!(node = %self.id, state = %next, "Dead node cannot change state");
            return false;
        }

        tracing::debug!(node = %self.id, from = %self.state, to = %next, "Node state change");
        self.state = next;

        if next == NodeState::Dead {
            self.teardown();
        }
        true
    }

    /// Queue `message` for delivery.
    pub fn send(&self, message: &Rpc) -> Result<()> {
        let outbox = self.outbox.as_ref().ok_or(ClusterError::NodeDead(self.id))?;
        outbox
            .send(Outbound::Message(message.encode()))
            .map_err(|_| ClusterError::NodeDead(self.id))
    }

    /// Accept an inbound payload. Returns it for dispatch if the owner has
    /// subscribed, otherwise keeps it until [`RaftNode::subscribe`].
    pub fn on_data(&mut self, payload: Vec<u8>) -> Option<Vec<u8>> {
        if self.state == NodeState::Dead {
            return None;
        }
        if self.subscribed {
            Some(payload)
        } else {
            self.backlog.push(payload);
            None
        }
    }

    /// Start delivering inbound data to the owner; returns what arrived before.
    pub fn subscribe(&mut self) -> Vec<Vec<u8>> {
        self.subscribed = true;
        std::mem::take(&mut self.backlog)
    }

    fn link(&self) -> Option<PeerHandle> {
        match (self.handle, &self.peer) {
            (Some(handle), _) => Some(handle),
            (None, Peer::Accepted(handle)) => Some(*handle),
            (None, Peer::Address(_)) => None,
        }
    }

    fn teardown(&mut self) {
        if let Some(outbox) = self.outbox.take() {
            // The writer disconnects after flushing what is already queued.
            let _ = outbox.send(Outbound::Disconnect);
        } else if let Some(handle) = self.link() {
            self.spawn_disconnect(handle);
        }
        self.handle = None;
        self.backlog.clear();
    }

    fn spawn_disconnect(&self, handle: PeerHandle) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect(handle).await {
                tracing::debug!(peer = %handle, error = %e, "Disconnect failed");
            }
        });
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish()
    }
}

fn spawn_writer(
    transport: Arc<dyn Transport>,
    handle: PeerHandle,
    id: NodeId,
) -> mpsc::UnboundedSender<Outbound> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(payload) => {
                    if let Err(e) = transport.send(handle, payload).await {
                        tracing::trace!(node = %id, error = %e, "Send failed");
                    }
                }
                Outbound::Disconnect => {
                    if let Err(e) = transport.disconnect(handle).await {
                        tracing::debug!(node = %id, error = %e, "Disconnect failed");
                    }
                    break;
                }
            }
        }
    });
    tx
}
