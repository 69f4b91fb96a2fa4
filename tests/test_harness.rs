//! Test harness for in-process cluster integration tests.
//!
//! Provides utilities for spawning, managing, and testing multi-member
//! clusters on a shared `MemoryNetwork`. Tests run with a paused tokio clock,
//! so the polling helpers below advance virtual time rather than wall time.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rafty::config::ClusterConfig;
use rafty::discovery::{Discovery, StaticDiscovery};
use rafty::raft::{Cluster, ClusterHandle, ClusterState, ClusterStatus, NodeId};
use rafty::transport::MemoryNetwork;

pub fn test_config() -> ClusterConfig {
    ClusterConfig::default()
}

pub fn address(index: usize) -> String {
    format!("node-{}", index + 1)
}

/// Handle to a running test member
pub struct TestNode {
    pub address: String,
    pub handle: ClusterHandle,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.handle.id()
    }

    /// Latest published status
    pub fn status(&self) -> ClusterStatus {
        self.handle.current()
    }

    pub fn is_leader(&self) -> bool {
        self.status().is_leader()
    }

    pub fn current_term(&self) -> i64 {
        self.status().term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.status().leader
    }
}

/// Test cluster managing multiple members
pub struct TestCluster {
    pub network: MemoryNetwork,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `num_nodes` members back to back, each discovering all the others.
    pub async fn new(num_nodes: usize) -> Self {
        let mut cluster = Self::empty();
        let addresses: Vec<String> = (0..num_nodes).map(address).collect();

        for (i, addr) in addresses.iter().enumerate() {
            let peers: Vec<String> = addresses
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, a)| a.clone())
                .collect();
            cluster
                .start_node(addr, Arc::new(StaticDiscovery::new(peers)))
                .await;
        }
        cluster
    }

    /// Start members one at a time; each discovers the members already running
    /// and waits until it has settled before the next one starts.
    pub async fn sequential(num_nodes: usize) -> Self {
        let mut cluster = Self::empty();
        for i in 0..num_nodes {
            let peers: Vec<String> = cluster.nodes.iter().map(|n| n.address.clone()).collect();
            cluster
                .start_node(&address(i), Arc::new(StaticDiscovery::new(peers)))
                .await;

            let node = &cluster.nodes[i];
            assert_eventually(
                || async {
                    matches!(
                        node.status().state,
                        ClusterState::Leader | ClusterState::Follower
                    ) && node.leader_id().is_some()
                },
                Duration::from_secs(10),
                "member should settle after joining",
            )
            .await;
        }
        cluster
    }

    pub fn empty() -> Self {
        Self {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
        }
    }

    /// Start one member on `addr` and add it to the cluster
    pub async fn start_node(&mut self, addr: &str, discovery: Arc<dyn Discovery>) -> &TestNode {
        let transport = self.network.transport(addr);
        let handle = Cluster::new(test_config())
            .with_transport(Arc::new(transport))
            .with_discovery(discovery)
            .start()
            .await
            .expect("member should start");

        self.nodes.push(TestNode {
            address: addr.to_string(),
            handle,
        });
        self.nodes.last().expect("just pushed")
    }

    pub fn get_node(&self, id: NodeId) -> Option<&TestNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// IDs of members currently in LEADER
    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leader())
            .map(|n| n.id())
            .collect()
    }

    /// True when exactly one member leads and every other member follows it
    pub fn has_stable_leader(&self) -> bool {
        let leaders = self.leaders();
        if leaders.len() != 1 {
            return false;
        }
        let leader = leaders[0];
        self.nodes.iter().all(|n| {
            let status = n.status();
            status.leader == Some(leader)
                && (status.id == leader || status.state == ClusterState::Follower)
        })
    }

    /// Wait until a single leader is followed by every member
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<NodeId> {
        let result = wait_for(
            || async { self.has_stable_leader() },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            self.leaders().first().copied()
        } else {
            None
        }
    }

    /// Wait until every member has `expected` linked peers in CONNECTED
    pub async fn wait_for_mesh(&self, expected: usize, timeout_duration: Duration) -> bool {
        wait_for(
            || async {
                self.nodes
                    .iter()
                    .all(|n| n.status().connected_members() == expected)
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await
    }

    /// Stop a member and remove it from the cluster
    pub async fn stop_node(&mut self, id: NodeId) -> bool {
        let Some(index) = self.nodes.iter().position(|n| n.id() == id) else {
            return false;
        };
        let node = self.nodes.remove(index);
        node.handle.stop().await.is_ok()
    }

    pub async fn stop_all(&mut self) {
        for node in self.nodes.drain(..) {
            let _ = node.handle.stop().await;
        }
    }
}

/// Poll `condition` until it holds or `timeout_duration` elapses
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
