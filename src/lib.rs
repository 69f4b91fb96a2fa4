pub mod config;
pub mod discovery;
pub mod error;
pub mod raft;
pub mod shutdown;
pub mod transport;

pub use config::{ClusterConfig, RegistryConfig};
pub use error::{ClusterError, Result};
pub use raft::{Cluster, ClusterHandle, ClusterState, ClusterStatus, NodeId};
