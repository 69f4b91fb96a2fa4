use thiserror::Error;

use crate::raft::rpc::ProtocolError;
use crate::raft::NodeId;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("No transport has been configured")]
    NoTransport,

    #[error("Duplicate node {0} rejected")]
    DuplicateNode(NodeId),

    #[error("Node {0} is dead")]
    NodeDead(NodeId),

    #[error("Cluster event loop has stopped")]
    Stopped,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
