//! shoal node
//!
//! Runs one cluster node with a stateless echo service on message type
//! 1000: every request is answered with its own payload.
//!
//! ## Lifecycle
//!
//! - Loads `SHOAL_*` configuration and connects the registry store
//! - Starts the node service (bind, join, heartbeat, reconciliation)
//! - Stops on ctrl-c or when the node is evicted from the registry

use std::sync::Arc;

use anyhow::Result;
use shoal_node::controller::{ActorMessage, HandlerResult, PacketHandler, RoutingTable, StatelessController};
use shoal_node::registry::connect_store;
use shoal_node::{NodeConfig, NodeService};
use shoal_wire::MessageType;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Message type served by the echo handler.
const ECHO: MessageType = MessageType::FIRST_APPLICATION;

fn echo(msg: &ActorMessage) -> HandlerResult {
    Ok(Some(msg.packet.payload.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        kind = %config.node_kind,
        api_name = %config.api_name,
        cluster = %config.cluster,
        port = config.port,
        "Starting shoal node"
    );

    let store = connect_store(&config.registry_url, &config.cluster).await?;
    let controller = Arc::new(StatelessController::new(
        RoutingTable::<dyn PacketHandler>::new().route(ECHO, echo),
    ));

    let node = NodeService::start(config, store, controller).await?;
    info!(
        node_id = %node.node_id(),
        address = %node.local_address(),
        "Node running"
    );

    let fatal = node.fatal_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = fatal.cancelled() => {
            error!(node_id = %node.node_id(), "Fatal condition, shutting down");
        }
    }

    node.stop().await;

    info!("Node shutdown complete");
    Ok(())
}
