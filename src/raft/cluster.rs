use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ClusterConfig;
use crate::discovery::Discovery;
use crate::error::{ClusterError, Result};
use crate::raft::node::RaftNode;
use crate::raft::notify::{Change, Notifiable, UniqueList};
use crate::raft::rpc::Rpc;
use crate::raft::state::{
    quorum, ClusterState, ClusterStatus, MemberStatus, NodeId, NodeState, Term, STOPPED_TERM,
};
use crate::raft::timer::{Timer, TimerDuration};
use crate::transport::{Connection, Peer, PeerHandle, Transport, TransportError, TransportEvent};

/// Requests from a [`ClusterHandle`] to the event loop.
#[derive(Debug)]
pub enum Command {
    Status(oneshot::Sender<ClusterStatus>),
    Join(String),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Election,
    Vote,
    Heartbeat,
}

/// Work the engine posts to itself.
#[derive(Debug)]
enum Event {
    Joined {
        ticket: u64,
        outcome: std::result::Result<Connection, TransportError>,
    },
    /// Send the discovery handshake to a freshly admitted node.
    Discover(NodeId),
    Timer { kind: TimerKind, generation: u64 },
}

/// A mutation reported by one of the engine's observable fields.
#[derive(Debug)]
enum Changed {
    State(Change<ClusterState>),
    Term(Change<Term>),
    Leader(Change<Option<NodeId>>),
    Nodes(Change<Option<NodeId>>),
}

/// Traffic on a link whose connect has not been resolved yet.
#[derive(Debug, Default)]
struct Unclaimed {
    payloads: Vec<Vec<u8>>,
    closed: bool,
}

/// Builder for a cluster member.
pub struct Cluster {
    config: ClusterConfig,
    transport: Option<Arc<dyn Transport>>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            transport: None,
            discovery: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Start the transport, discover peers and spawn the event loop.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NoTransport`] if no transport was configured,
    /// or the transport's error if it fails to start.
    pub async fn start(self) -> Result<ClusterHandle> {
        let transport = self.transport.ok_or(ClusterError::NoTransport)?;
        let (mut engine, commands) = Engine::new(self.config, transport);
        engine.start(self.discovery).await?;
        engine.publish_status();

        let handle = ClusterHandle {
            id: engine.id,
            commands,
            status: engine.status_tx.subscribe(),
        };
        tokio::spawn(engine.run());
        Ok(handle)
    }
}

/// Cheap, clonable handle to a running member.
///
/// The member keeps running while at least one handle exists or until
/// [`ClusterHandle::stop`] is called.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    id: NodeId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ClusterStatus>,
}

impl ClusterHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Fresh status straight from the event loop.
    pub async fn status(&self) -> Result<ClusterStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .await
            .map_err(|_| ClusterError::Stopped)?;
        rx.await.map_err(|_| ClusterError::Stopped)
    }

    /// Last status published by the event loop.
    pub fn current(&self) -> ClusterStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<ClusterStatus>
    where
        F: FnMut(&ClusterStatus) -> bool,
    {
        let mut status = self.subscribe();
        let result = status
            .wait_for(predicate)
            .await
            .map(|s| s.clone())
            .map_err(|_| ClusterError::Stopped);
        result
    }

    /// Connect to one more peer.
    pub async fn join(&self, address: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::Join(address.into()))
            .await
            .map_err(|_| ClusterError::Stopped)
    }

    /// Disconnect every peer and stop the transport.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(tx))
            .await
            .map_err(|_| ClusterError::Stopped)?;
        rx.await.map_err(|_| ClusterError::Stopped)
    }
}

/// Election and term state machine.
///
/// Owned by a single task. Every observable field is wrapped so that a
/// mutation hands its [`Change`] to [`Engine::on_property_changed`] before the
/// setter returns; that handler is the only place transitions cause side
/// effects (arming timers, broadcasting).
pub(crate) struct Engine {
    id: NodeId,
    transport: Arc<dyn Transport>,

    state: Notifiable<ClusterState>,
    term: Notifiable<Term>,
    leader: Notifiable<Option<NodeId>>,
    /// Admitted members in join order; the nodes themselves live in `arena`.
    nodes: UniqueList<NodeId>,
    arena: HashMap<NodeId, RaftNode>,
    joining: HashMap<u64, RaftNode>,
    next_ticket: u64,
    unclaimed: HashMap<PeerHandle, Unclaimed>,

    voted: bool,
    votes_granted: usize,
    votes_seen: usize,
    connecting: usize,
    last_heartbeat_at: Option<DateTime<Utc>>,

    election_timer: Timer,
    vote_timer: Timer,
    heartbeat_timer: Timer,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ClusterStatus>,
}

impl Engine {
    pub(crate) fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::Sender<Command>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(100);

        let id = transport.local_id().unwrap_or_else(NodeId::generate);
        let timer = |kind: TimerKind, duration: TimerDuration| {
            let events = events_tx.clone();
            Timer::new(duration, move |generation| {
                let _ = events.send(Event::Timer { kind, generation });
            })
        };
        let election_timer = timer(TimerKind::Election, config.election_timeout());
        let vote_timer = timer(TimerKind::Vote, config.vote_timeout());
        let heartbeat_timer = timer(TimerKind::Heartbeat, config.heartbeat_interval());

        let (status_tx, _) = watch::channel(ClusterStatus {
            id,
            state: ClusterState::Dead,
            term: 0,
            leader: None,
            members: Vec::new(),
            connecting: 0,
            last_heartbeat_at: None,
        });

        let engine = Self {
            id,
            transport,
            state: Notifiable::new("state", ClusterState::Dead),
            term: Notifiable::new("term", 0),
            leader: Notifiable::new("leader", None),
            nodes: UniqueList::new("nodes"),
            arena: HashMap::new(),
            joining: HashMap::new(),
            next_ticket: 0,
            unclaimed: HashMap::new(),
            voted: false,
            votes_granted: 0,
            votes_seen: 0,
            connecting: 0,
            last_heartbeat_at: None,
            election_timer,
            vote_timer,
            heartbeat_timer,
            events_tx,
            events_rx,
            transport_tx,
            transport_rx,
            commands_rx,
            status_tx,
        };

        (engine, commands_tx)
    }

    pub(crate) fn state(&self) -> ClusterState {
        *self.state.get()
    }

    pub(crate) fn term(&self) -> Term {
        *self.term.get()
    }

    pub(crate) fn leader(&self) -> Option<NodeId> {
        *self.leader.get()
    }

    /// Votes needed to win against the admitted peers.
    pub(crate) fn quorum(&self) -> usize {
        quorum(self.nodes.len())
    }

    pub(crate) fn status(&self) -> ClusterStatus {
        ClusterStatus {
            id: self.id,
            state: self.state(),
            term: self.term(),
            leader: self.leader(),
            members: self
                .nodes
                .iter()
                .filter_map(|id| self.arena.get(id))
                .map(|node| MemberStatus {
                    id: node.id(),
                    state: node.state(),
                })
                .collect(),
            connecting: self.connecting,
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub(crate) async fn start(&mut self, discovery: Option<Arc<dyn Discovery>>) -> Result<()> {
        self.transport.start(self.transport_tx.clone()).await?;
        tracing::info!(node_id = %self.id, "Starting cluster member");
        self.set_state(ClusterState::Connecting);

        let peers = match discovery {
            Some(discovery) => match discovery.discover().await {
                Ok(peers) => peers,
                Err(e) => {
                    tracing::warn!(node_id = %self.id, error = %e, "Discovery failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if peers.is_empty() {
            tracing::info!(node_id = %self.id, "No peers discovered, bootstrapping alone");
            self.set_state(ClusterState::Candidate);
        } else {
            for peer in peers {
                self.join(Peer::Address(peer));
            }
        }
        Ok(())
    }

    async fn run(mut self) {
        while self.step().await {
            self.publish_status();
        }
        tracing::debug!(node_id = %self.id, "Event loop finished");
    }

    /// Process one event. Returns false once the member has stopped.
    pub(crate) async fn step(&mut self) -> bool {
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => {
                self.handle_event(event);
                true
            }
            Some(event) = self.transport_rx.recv() => {
                self.handle_transport_event(event);
                true
            }
            command = self.commands_rx.recv() => match command {
                Some(Command::Status(reply)) => {
                    let _ = reply.send(self.status());
                    true
                }
                Some(Command::Join(address)) => {
                    self.join(Peer::Address(address));
                    true
                }
                Some(Command::Stop(reply)) => {
                    self.stop().await;
                    self.publish_status();
                    let _ = reply.send(());
                    false
                }
                None => {
                    self.stop().await;
                    self.publish_status();
                    false
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Joined { ticket, outcome } => self.on_joined(ticket, outcome),
            Event::Discover(id) => self.send_to(id, &Rpc::Discover),
            Event::Timer { kind, generation } => {
                let timer = match kind {
                    TimerKind::Election => &self.election_timer,
                    TimerKind::Vote => &self.vote_timer,
                    TimerKind::Heartbeat => &self.heartbeat_timer,
                };
                if !timer.accept(generation) {
                    tracing::trace!(node_id = %self.id, ?kind, generation, "Ignoring stale timer");
                    return;
                }
                match kind {
                    TimerKind::Election => self.on_election_timeout(),
                    TimerKind::Vote => self.on_vote_timeout(),
                    TimerKind::Heartbeat => self.on_heartbeat_tick(),
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(handle) => {
                tracing::debug!(node_id = %self.id, peer = %handle, "Inbound connection");
                self.join(Peer::Accepted(handle));
            }
            TransportEvent::Disconnected(handle) => self.leave(handle),
            TransportEvent::Data { peer, payload } => {
                if let Some(node) = self.arena.values_mut().find(|n| n.is_bound_to(peer)) {
                    let id = node.id();
                    if let Some(payload) = node.on_data(payload) {
                        self.receive_payload(id, &payload);
                    }
                } else if let Some(node) = self.joining.values_mut().find(|n| n.is_bound_to(peer)) {
                    node.on_data(payload);
                } else if self.awaiting_link() {
                    self.unclaimed.entry(peer).or_default().payloads.push(payload);
                } else {
                    tracing::debug!(node_id = %self.id, peer = %peer, "Dropping data for unknown link");
                }
            }
        }
    }

    /// True while some dial has not reported its link handle yet.
    fn awaiting_link(&self) -> bool {
        self.joining
            .values()
            .any(|n| n.handle().is_none() && matches!(n.peer(), Peer::Address(_)))
    }

    /// Forget buffered traffic once no pending dial can claim it.
    fn purge_unclaimed(&mut self) {
        if !self.unclaimed.is_empty() && !self.awaiting_link() {
            tracing::debug!(node_id = %self.id, links = self.unclaimed.len(), "Dropping unclaimed links");
            self.unclaimed.clear();
        }
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    pub(crate) fn join(&mut self, peer: Peer) {
        self.connecting += 1;
        let node = RaftNode::new(peer, self.transport.clone());
        tracing::debug!(node_id = %self.id, peer = %node.peer(), "Joining peer");

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let setup = node.setup();
        let events = self.events_tx.clone();
        self.joining.insert(ticket, node);

        tokio::spawn(async move {
            let outcome = setup.await;
            let _ = events.send(Event::Joined { ticket, outcome });
        });
    }

    fn on_joined(&mut self, ticket: u64, outcome: std::result::Result<Connection, TransportError>) {
        let Some(mut node) = self.joining.remove(&ticket) else {
            return;
        };
        self.connecting = self.connecting.saturating_sub(1);

        let early = outcome
            .as_ref()
            .ok()
            .and_then(|conn| self.unclaimed.remove(&conn.handle))
            .unwrap_or_default();
        self.purge_unclaimed();

        let admitted = node
            .complete_setup(outcome)
            .and_then(|()| {
                if early.closed {
                    Err(ClusterError::NodeDead(node.id()))
                } else {
                    self.check_unique(node.id())
                }
            });

        match admitted {
            Ok(()) => {
                for payload in early.payloads {
                    node.on_data(payload);
                }
                self.admit(node);
            }
            Err(e) => {
                tracing::warn!(
                    node_id = %self.id,
                    peer = %node.peer(),
                    error = %e,
                    "Failed to join peer"
                );
                if node.state() != NodeState::Dead {
                    node.change_state(NodeState::Dead);
                }
            }
        }

        self.check_mesh_ready();
    }

    fn check_unique(&self, id: NodeId) -> Result<()> {
        if id == self.id || self.arena.contains_key(&id) {
            return Err(ClusterError::DuplicateNode(id));
        }
        Ok(())
    }

    fn admit(&mut self, node: RaftNode) {
        let id = node.id();
        tracing::info!(node_id = %self.id, peer_id = %id, peer = %node.peer(), "Peer joined");
        self.arena.insert(id, node);
        if let Some(change) = self.nodes.add(id) {
            self.on_property_changed(Changed::Nodes(change));
        }
        let _ = self.events_tx.send(Event::Discover(id));
    }

    /// Drop the member on link `handle`.
    pub(crate) fn leave(&mut self, handle: PeerHandle) {
        let admitted = self
            .arena
            .values()
            .find(|n| n.is_bound_to(handle))
            .map(|n| n.id());

        if let Some(id) = admitted {
            if let Some(change) = self.nodes.remove(&id) {
                self.on_property_changed(Changed::Nodes(change));
            }
            self.check_mesh_ready();
        } else if let Some(node) = self.joining.values_mut().find(|n| n.is_bound_to(handle)) {
            node.change_state(NodeState::Dead);
        } else if self.awaiting_link() {
            self.unclaimed.entry(handle).or_default().closed = true;
        }
    }

    fn is_mesh_ready(&self) -> bool {
        self.connecting == 0 && self.arena.values().all(|n| n.is_connected())
    }

    fn check_mesh_ready(&mut self) {
        if self.state() == ClusterState::Connecting && self.is_mesh_ready() {
            tracing::info!(node_id = %self.id, peers = self.nodes.len(), "Mesh ready");
            self.set_state(ClusterState::Follower);
        }
    }

    // ---------------------------------------------------------------------
    // Protocol
    // ---------------------------------------------------------------------

    fn receive_payload(&mut self, from: NodeId, payload: &[u8]) {
        match Rpc::decode(payload) {
            Ok(message) => self.receive(from, message),
            Err(e) => {
                let e = ClusterError::from(e);
                tracing::warn!(node_id = %self.id, from = %from, error = %e, "Dropping message");
            }
        }
    }

    pub(crate) fn receive(&mut self, from: NodeId, message: Rpc) {
        tracing::debug!(
            node_id = %self.id,
            from = %from,
            rpc = %message,
            term = self.term(),
            state = %self.state(),
            "Received"
        );

        match message {
            Rpc::Discover => {
                let reply = Rpc::DiscoverReply {
                    leader: self.leader(),
                    term: self.term(),
                    nodes: self.nodes.iter().copied().collect(),
                };
                self.send_to(from, &reply);
            }
            Rpc::DiscoverReply { .. } => {
                if let Some(node) = self.arena.get_mut(&from) {
                    if node.state() == NodeState::Discovery {
                        node.change_state(NodeState::Connected);
                    }
                }
                self.check_mesh_ready();
            }
            Rpc::Vote { term, id } => self.on_vote(from, term, id),
            Rpc::VoteOk => self.on_vote_ok(from),
            Rpc::Heartbeat { term, leader } => self.on_heartbeat(term, leader),
        }
    }

    fn on_vote(&mut self, from: NodeId, term: Term, candidate: NodeId) {
        self.vote_timer.cancel();
        self.votes_seen += 1;

        if term > self.term() {
            // Re-entering CANDIDATE adds the missing unit back.
            self.set_term(term - 1);
            self.set_state(ClusterState::SplitVote);
        }

        if !self.voted {
            self.voted = true;
            tracing::info!(node_id = %self.id, candidate = %candidate, term, "Granting vote");
            self.send_to(from, &Rpc::VoteOk);
            self.restart_election_timer();
        } else if self.votes_seen == self.nodes.len() {
            tracing::debug!(node_id = %self.id, term = self.term(), "Split vote");
            self.set_state(ClusterState::SplitVote);
        }
    }

    fn on_vote_ok(&mut self, from: NodeId) {
        self.votes_seen += 1;
        self.votes_granted += 1;
        tracing::debug!(
            node_id = %self.id,
            from = %from,
            votes = self.votes_granted,
            needed = self.quorum(),
            "Received vote"
        );

        if self.votes_granted >= self.quorum() {
            self.set_leader(Some(self.id));
        } else if self.votes_seen == self.nodes.len() {
            tracing::debug!(node_id = %self.id, term = self.term(), "Split vote");
            self.set_state(ClusterState::SplitVote);
        }
    }

    fn on_heartbeat(&mut self, term: Term, leader: NodeId) {
        self.last_heartbeat_at = Some(Utc::now());
        if self.term() <= term {
            self.set_term(term);
            self.set_leader(Some(leader));
        } else {
            tracing::debug!(
                node_id = %self.id,
                term,
                local_term = self.term(),
                "Ignoring stale heartbeat"
            );
        }
        // Adoption cancels timers; re-arm afterwards.
        self.election_timer.reset();
    }

    fn on_election_timeout(&mut self) {
        match self.state() {
            ClusterState::Follower => {
                tracing::info!(node_id = %self.id, term = self.term(), "Election timeout, starting election");
                self.set_state(ClusterState::Candidate);
            }
            ClusterState::Candidate => {
                tracing::info!(node_id = %self.id, term = self.term(), "Election round timed out");
                self.set_state(ClusterState::SplitVote);
            }
            _ => {}
        }
    }

    fn on_vote_timeout(&mut self) {
        if self.state() != ClusterState::Candidate || self.voted {
            return;
        }
        self.voted = true;
        self.votes_granted += 1;
        tracing::info!(node_id = %self.id, term = self.term(), "Requesting votes");
        self.broadcast(&Rpc::Vote {
            term: self.term(),
            id: self.id,
        });
        self.restart_election_timer();
    }

    fn on_heartbeat_tick(&mut self) {
        if self.state() != ClusterState::Leader {
            self.heartbeat_timer.cancel();
            return;
        }
        let heartbeat = Rpc::Heartbeat {
            term: self.term(),
            leader: self.id,
        };
        for id in self.nodes.iter() {
            if let Some(node) = self.arena.get(id).filter(|n| n.is_connected()) {
                if let Err(e) = node.send(&heartbeat) {
                    tracing::trace!(node_id = %self.id, peer_id = %id, error = %e, "Heartbeat not sent");
                }
            }
        }
    }

    fn restart_election_timer(&mut self) {
        self.election_timer.cancel();
        self.election_timer.once();
    }

    fn send_to(&self, id: NodeId, message: &Rpc) {
        match self.arena.get(&id) {
            Some(node) => {
                if let Err(e) = node.send(message) {
                    tracing::debug!(node_id = %self.id, peer_id = %id, rpc = %message, error = %e, "Send failed");
                }
            }
            None => {
                tracing::debug!(node_id = %self.id, peer_id = %id, rpc = %message, "Send to unknown peer");
            }
        }
    }

    fn broadcast(&self, message: &Rpc) {
        for id in self.nodes.iter() {
            self.send_to(*id, message);
        }
    }

    // ---------------------------------------------------------------------
    // Observable fields
    // ---------------------------------------------------------------------

    fn set_state(&mut self, state: ClusterState) {
        if let Some(change) = self.state.set(state) {
            self.on_property_changed(Changed::State(change));
        }
    }

    fn set_term(&mut self, term: Term) {
        if let Some(change) = self.term.set(term) {
            self.on_property_changed(Changed::Term(change));
        }
    }

    fn set_leader(&mut self, leader: Option<NodeId>) {
        if let Some(change) = self.leader.set(leader) {
            self.on_property_changed(Changed::Leader(change));
        }
    }

    fn on_property_changed(&mut self, changed: Changed) {
        match changed {
            Changed::State(change) => {
                tracing::info!(
                    node_id = %self.id,
                    from = %change.prev,
                    to = %change.current,
                    term = self.term(),
                    "State change"
                );
                self.on_state_entered(change.current);
            }
            Changed::Term(change) => {
                tracing::debug!(node_id = %self.id, from = change.prev, to = change.current, "Term change");
                self.voted = false;
                self.votes_granted = 0;
                self.votes_seen = 0;
            }
            Changed::Leader(change) => {
                self.heartbeat_timer.cancel();
                self.election_timer.cancel();
                self.vote_timer.cancel();
                match change.current {
                    Some(leader) if leader == self.id => {
                        tracing::info!(node_id = %self.id, term = self.term(), "Became leader");
                        self.set_state(ClusterState::Leader);
                    }
                    Some(leader) => {
                        tracing::info!(node_id = %self.id, leader = %leader, term = self.term(), "Following leader");
                        self.set_state(ClusterState::Follower);
                    }
                    None => {}
                }
            }
            Changed::Nodes(change) => {
                if let Some(id) = change.current {
                    self.on_node_admitted(id);
                }
                if let Some(id) = change.prev {
                    self.on_node_removed(id);
                }
            }
        }
    }

    fn on_state_entered(&mut self, state: ClusterState) {
        match state {
            ClusterState::Candidate => {
                // Cleared so that winning this round registers as a leader change.
                self.set_leader(None);
                self.election_timer.cancel();
                self.set_term(self.term() + 1);
                if self.nodes.is_empty() {
                    self.set_leader(Some(self.id));
                } else {
                    self.vote_timer.once();
                }
            }
            ClusterState::SplitVote => self.set_state(ClusterState::Candidate),
            ClusterState::Follower => self.election_timer.once(),
            ClusterState::Leader => self.heartbeat_timer.indefinite(),
            ClusterState::Dead | ClusterState::Connecting => {}
        }
    }

    fn on_node_admitted(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(&id) else {
            return;
        };
        for payload in node.subscribe() {
            self.receive_payload(id, &payload);
        }
        if self.leader() == Some(self.id) {
            self.send_to(
                id,
                &Rpc::Heartbeat {
                    term: self.term(),
                    leader: self.id,
                },
            );
        }
    }

    fn on_node_removed(&mut self, id: NodeId) {
        if let Some(mut node) = self.arena.remove(&id) {
            tracing::info!(node_id = %self.id, peer_id = %id, "Peer left");
            if node.state() != NodeState::Dead {
                node.change_state(NodeState::Dead);
            }
        }
    }

    /// Disconnect every peer, cancel timers and stop the transport.
    pub(crate) async fn stop(&mut self) {
        tracing::info!(node_id = %self.id, term = self.term(), "Stopping cluster member");

        while let Some(id) = self.nodes.first().copied() {
            if let Some(change) = self.nodes.remove(&id) {
                self.on_property_changed(Changed::Nodes(change));
            }
        }
        for (_, mut node) in self.joining.drain() {
            if node.state() != NodeState::Dead {
                node.change_state(NodeState::Dead);
            }
        }
        self.unclaimed.clear();
        self.connecting = 0;

        self.heartbeat_timer.cancel();
        self.election_timer.cancel();
        self.vote_timer.cancel();
        self.set_state(ClusterState::Dead);
        self.set_term(STOPPED_TERM);
        self.set_leader(None);

        if let Err(e) = self.transport.stop().await {
            let e = ClusterError::from(e);
            tracing::warn!(node_id = %self.id, error = %e, "Transport stop failed");
        }
    }
}
