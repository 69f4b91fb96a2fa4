pub mod cluster;
pub mod node;
pub mod notify;
pub mod rpc;
pub mod state;
pub mod timer;

pub use cluster::{Cluster, ClusterHandle};
pub use node::RaftNode;
pub use rpc::{ProtocolError, Rpc};
pub use state::{quorum, ClusterState, ClusterStatus, MemberStatus, NodeId, NodeState, Term};
pub use timer::{Timer, TimerDuration};
