//! Basic usage example for redis-mesh

use bytes::Bytes;
use futures::StreamExt;
use redis_mesh::{ClusterConfig, ClusterDirectory, NodeAddress};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt::init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let config = ClusterConfig::new([url])
        .with_cluster_name("demo")
        .with_node_lifetime_seconds(6);

    // Two nodes sharing one backend
    let alpha = ClusterDirectory::join(config.clone(), NodeAddress::new("alpha:9000")).await?;
    let beta = ClusterDirectory::join(config, NodeAddress::new("beta:9000")).await?;
    alpha.nodes().refresh().await?;
    println!("Active nodes: {:?}", alpha.active_nodes());

    // Actor placement
    let owner = alpha.register_actor("player/42", alpha.local()).await?;
    println!("Claimed player/42, previous owner: {:?}", owner);
    let lost = beta.register_actor("player/42", beta.local()).await?;
    println!("beta's claim lost to: {:?}", lost);

    let moved = alpha
        .move_actor("player/42", alpha.local(), beta.local())
        .await?;
    println!("Moved player/42 to beta: {}", moved);
    println!("player/42 lives on {:?}", alpha.lookup_actor("player/42").await?);

    // Messaging
    let mut inbox = beta.messages().await?;
    alpha
        .send_message(beta.local(), Bytes::from_static(b"hello beta"))
        .await?;
    if let Ok(Some(message)) = tokio::time::timeout(Duration::from_secs(1), inbox.next()).await {
        println!("beta received: {:?}", message?);
    }

    // Membership events as beta leaves
    let mut events = alpha.membership_events();
    beta.shutdown().await;
    alpha.nodes().refresh().await?;
    while let Ok(event) = events.try_recv() {
        println!("Membership event: {:?}", event);
    }

    alpha.actors().clear().await?;
    alpha.shutdown().await;
    Ok(())
}
