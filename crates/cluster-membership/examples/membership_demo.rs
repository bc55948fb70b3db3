//! Cluster membership demonstration
//!
//! This example starts three SWIM members on an in-process network, crashes
//! one of them and shows how the survivors detect and remove it.

use cluster_membership::testing::LocalNetwork;
use cluster_membership::{
    create_protocol, BootstrapDiscoveryService, GroupMembershipProtocol, Member,
    MembershipEvent, Node, ProtocolConfig, SwimConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("🚀 Starting Cluster Membership Demo");

    let config = ProtocolConfig::Swim(SwimConfig {
        gossip_interval: Duration::from_millis(100),
        probe_interval: Duration::from_millis(250),
        failure_timeout: Duration::from_secs(2),
        sync_interval: Duration::from_secs(2),
        ..SwimConfig::default()
    });
    let network = LocalNetwork::new();
    let seed_address: SocketAddr = "127.0.0.1:8001".parse()?;

    let mut nodes = Vec::new();
    for (index, port) in [8001u16, 8002, 8003].into_iter().enumerate() {
        let address: SocketAddr = format!("127.0.0.1:{}", port).parse()?;
        let member = Member::new(format!("node-{}", index + 1), address)
            .with_zone("zone-a")
            .with_version("1.0.0");

        let seeds = if port == 8001 {
            vec![]
        } else {
            vec![Node::new("node-1", seed_address)]
        };

        let protocol = create_protocol(&config)?;
        let name = member.id.to_string();
        protocol.add_listener(Arc::new(move |event: &MembershipEvent| {
            println!("  [{}] {:?} {}", name, event.event_type, event.subject.summary());
        }));
        protocol
            .join(
                network.bootstrap(address),
                Arc::new(BootstrapDiscoveryService::new(seeds)),
                member.clone(),
            )
            .await?;
        nodes.push((member, protocol));
    }

    // Wait for cluster formation
    sleep(Duration::from_secs(2)).await;
    print_view(&nodes);

    println!("\n💥 Crashing node-3...");
    network.disconnect("127.0.0.1:8003".parse()?);
    sleep(Duration::from_secs(5)).await;
    print_view(&nodes[..2]);

    println!("\n🧹 Shutting down...");
    for (member, protocol) in &nodes {
        protocol.leave(member).await?;
    }

    println!("✅ Demo completed");
    Ok(())
}

fn print_view(nodes: &[(Member, Arc<dyn GroupMembershipProtocol>)]) {
    println!("\n📊 Membership views:");
    for (member, protocol) in nodes {
        let view: Vec<String> = protocol
            .members()
            .iter()
            .map(|m| format!("{}({})", m.id, m.state))
            .collect();
        println!("  {} sees {}", member.id, view.join(", "));
    }
}
