use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical clock. `-1` is the sentinel for a stopped cluster.
pub type Term = i64;

pub const STOPPED_TERM: Term = -1;

/// Cluster-wide unique identifier of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn generate() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    Dead,
    Connecting,
    Follower,
    Candidate,
    SplitVote,
    Leader,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Dead => "DEAD",
            ClusterState::Connecting => "CONNECTING",
            ClusterState::Follower => "FOLLOWER",
            ClusterState::Candidate => "CANDIDATE",
            ClusterState::SplitVote => "SPLIT_VOTE",
            ClusterState::Leader => "LEADER",
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a link to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Initial,
    Discovery,
    Connected,
    Dead,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Initial => "INITIAL",
            NodeState::Discovery => "DISCOVERY",
            NodeState::Connected => "CONNECTED",
            NodeState::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Votes needed to win an election against `peer_count` admitted peers.
///
/// Self is not part of `peer_count`, but the candidate's own vote counts
/// towards the result.
pub fn quorum(peer_count: usize) -> usize {
    peer_count / 2 + 1
}

/// Point-in-time view of a member, published after every processed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub id: NodeId,
    pub state: ClusterState,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub members: Vec<MemberStatus>,
    pub connecting: usize,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl ClusterStatus {
    pub fn is_leader(&self) -> bool {
        self.state == ClusterState::Leader
    }

    pub fn connected_members(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state == NodeState::Connected)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub id: NodeId,
    pub state: NodeState,
}
