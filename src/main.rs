use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use rafty::config::{ClusterConfig, RegistryConfig};
use rafty::discovery::{Registry, RegistryDiscovery};
use rafty::raft::{Cluster, ClusterHandle, ClusterStatus};
use rafty::shutdown::install_shutdown_handler;
use rafty::transport::MemoryNetwork;

#[derive(Parser, Debug)]
#[command(name = "rafty")]
#[command(version)]
#[command(about = "Simulate a leader-electing cluster on an in-process network")]
struct Args {
    /// Number of members to start
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// How often to print the cluster status
    #[arg(long, default_value = "1000")]
    status_interval_ms: u64,

    /// Output format
    #[arg(long, short = 'o', value_enum, default_value = "table")]
    output: OutputFormat,

    /// Lifetime of a registry entry; members refresh it every half TTL
    #[arg(long, default_value = "5000")]
    registry_ttl_ms: u64,

    /// Heartbeat interval of a leader
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

struct Member {
    handle: ClusterHandle,
    discovery: Arc<RegistryDiscovery>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = install_shutdown_handler()?;
    let network = MemoryNetwork::new();
    let registry = Registry::new();
    let registry_config = RegistryConfig {
        ttl_ms: args.registry_ttl_ms,
    };
    let config = ClusterConfig::default().with_heartbeat_interval(args.heartbeat_interval_ms);

    let mut members = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let address = format!("node-{}", i + 1);
        let transport = network.transport(address.clone());
        let discovery = Arc::new(RegistryDiscovery::new(
            registry.clone(),
            transport.id(),
            address.clone(),
            registry_config.clone(),
        ));

        let handle = Cluster::new(config.clone())
            .with_transport(Arc::new(transport))
            .with_discovery(discovery.clone())
            .start()
            .await?;
        discovery.bind();
        tracing::info!(node_id = %handle.id(), address = %address, "Member started");

        members.push(Member { handle, discovery });
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(args.status_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let mut statuses = Vec::with_capacity(members.len());
                for member in &members {
                    match member.handle.status().await {
                        Ok(status) => statuses.push(status),
                        Err(e) => tracing::warn!(node_id = %member.handle.id(), error = %e, "Status unavailable"),
                    }
                }
                print_statuses(&statuses, args.output)?;
            }
        }
    }

    for member in &members {
        member.discovery.unbind();
        if let Err(e) = member.handle.stop().await {
            tracing::warn!(node_id = %member.handle.id(), error = %e, "Stop failed");
        }
    }
    tracing::info!("Cluster stopped");
    Ok(())
}

fn print_statuses(
    statuses: &[ClusterStatus],
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(statuses)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<38} {:<11} {:>5} {:<38} {:>7}",
                "NODE", "STATE", "TERM", "LEADER", "PEERS"
            );
            println!("{}", "-".repeat(103));
            for status in statuses {
                let leader = status
                    .leader
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<11} {:>5} {:<38} {:>3}/{:<3}",
                    status.id.to_string(),
                    status.state.as_str(),
                    status.term,
                    leader,
                    status.connected_members(),
                    status.members.len()
                );
            }
            println!();
        }
    }
    Ok(())
}
