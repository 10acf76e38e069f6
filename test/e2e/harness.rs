//! Shared helpers for the cluster scenarios.
//!
//! Every node of a scenario runs in this process on 127.0.0.1 with an OS
//! chosen port, and all of them share one in-memory registry.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use shoal_node::registry::RegistryStore;
use shoal_node::{EventController, NodeConfig, NodeKind, NodeService};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub const HEARTBEAT: Duration = Duration::from_millis(50);
pub const TTL: Duration = Duration::from_millis(400);
pub const WAIT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Installs a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
            .with_test_writer()
            .try_init();
    });
}

/// Fast-ticking config for a node of `kind`.
pub fn config(kind: NodeKind, api_name: &str) -> NodeConfig {
    NodeConfig::default()
        .with_kind(kind, api_name)
        .with_port(0)
        .with_heartbeat(HEARTBEAT, TTL)
        .with_handshake(Duration::from_millis(500), 2)
        .with_request_timeout(Duration::from_secs(2))
}

pub async fn start(
    config: NodeConfig,
    store: &Arc<dyn RegistryStore>,
    controller: Arc<dyn EventController>,
) -> NodeService {
    NodeService::start(config, Arc::clone(store), controller)
        .await
        .expect("node should start")
}

/// Polls `check` until it holds or [`WAIT`] passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until every node has every other node in its topology.
pub async fn wait_for_mesh(nodes: &[&NodeService]) {
    for node in nodes {
        for other in nodes {
            if node.node_id() == other.node_id() {
                continue;
            }
            let (node, other_id) = ((*node).clone(), other.node_id());
            eventually("full mesh", move || {
                let node = node.clone();
                async move { node.topology().contains(other_id) }
            })
            .await;
        }
    }
}

/// Receives events until one matches `pred`.
pub async fn wait_for_event<T: Clone, F>(rx: &mut broadcast::Receiver<T>, mut pred: F) -> T
where
    F: FnMut(&T) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed"),
        Err(_) => panic!("timed out waiting for event"),
    }
}
