//! Configuration for a cluster node.

use std::time::Duration;

use anyhow::{anyhow, Result};
use shoal_reconcile::{BackoffPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

use crate::lifecycle::LifecycleConfig;
use crate::server_info::{NodeKind, Stickiness};
use crate::transport::TransportConfig;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Role of this node.
    pub node_kind: NodeKind,

    /// Logical API name (SubApi nodes).
    pub api_name: String,

    /// Stickiness policy advertised for the API group.
    pub stickiness: Stickiness,

    /// Registry namespace shared by all nodes of one cluster.
    pub cluster: String,

    /// Host to bind and advertise.
    pub host: String,

    /// Preferred port; the next free port is used on collision.
    pub port: u16,

    /// Heartbeat and reconciliation tick.
    pub heartbeat_interval: Duration,

    /// Registry entry TTL.
    pub heartbeat_ttl: Duration,

    /// Wait for a handshake response, per attempt.
    pub handshake_timeout: Duration,

    /// Handshake attempts per connect.
    pub handshake_retries: u32,

    /// Default timeout of requests to other nodes.
    pub request_timeout: Duration,

    /// Registry backend URL (`memory://` or `postgres://...`).
    pub registry_url: String,

    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_kind: NodeKind::MainApi,
            api_name: String::new(),
            stickiness: Stickiness::Stateless,
            cluster: "default".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7600,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_ttl: Duration::from_secs(15),
            handshake_timeout: Duration::from_millis(3000),
            handshake_retries: 3,
            request_timeout: Duration::from_millis(5000),
            registry_url: "memory://".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from `SHOAL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let node_kind = match lookup("SHOAL_NODE_KIND") {
            Some(raw) => raw.parse().map_err(|e: String| anyhow!(e))?,
            None => defaults.node_kind,
        };

        let stickiness = match lookup("SHOAL_STICKINESS") {
            Some(raw) => raw.parse().map_err(|e: String| anyhow!(e))?,
            None => defaults.stickiness,
        };

        let api_name = lookup("SHOAL_API_NAME").unwrap_or(defaults.api_name);
        if node_kind == NodeKind::SubApi && api_name.is_empty() {
            return Err(anyhow!("SHOAL_API_NAME is required for sub_api nodes"));
        }

        let cluster = lookup("SHOAL_CLUSTER").unwrap_or(defaults.cluster);
        let host = lookup("SHOAL_HOST").unwrap_or(defaults.host);

        let port = lookup("SHOAL_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let heartbeat_interval = lookup("SHOAL_HEARTBEAT_INTERVAL_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);

        let heartbeat_ttl = lookup("SHOAL_HEARTBEAT_TTL_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_ttl);

        let handshake_timeout = lookup("SHOAL_HANDSHAKE_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.handshake_timeout);

        let handshake_retries = lookup("SHOAL_HANDSHAKE_RETRIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.handshake_retries);

        let request_timeout = lookup("SHOAL_REQUEST_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout);

        let registry_url = lookup("SHOAL_REGISTRY_URL").unwrap_or(defaults.registry_url);
        let log_level = lookup("SHOAL_LOG_LEVEL").unwrap_or(defaults.log_level);

        if heartbeat_interval.is_zero() {
            return Err(anyhow!("SHOAL_HEARTBEAT_INTERVAL_SECS must be at least 1"));
        }
        if heartbeat_ttl <= heartbeat_interval {
            return Err(anyhow!(
                "heartbeat TTL ({heartbeat_ttl:?}) must exceed the heartbeat interval ({heartbeat_interval:?})"
            ));
        }

        Ok(Self {
            node_kind,
            api_name,
            stickiness,
            cluster,
            host,
            port,
            heartbeat_interval,
            heartbeat_ttl,
            handshake_timeout,
            handshake_retries,
            request_timeout,
            registry_url,
            log_level,
        })
    }

    #[must_use]
    pub fn with_kind(mut self, node_kind: NodeKind, api_name: impl Into<String>) -> Self {
        self.node_kind = node_kind;
        self.api_name = api_name.into();
        self
    }

    #[must_use]
    pub fn with_stickiness(mut self, stickiness: Stickiness) -> Self {
        self.stickiness = stickiness;
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the heartbeat tick and registry TTL.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, ttl: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_handshake(mut self, timeout: Duration, retries: u32) -> Self {
        self.handshake_timeout = timeout;
        self.handshake_retries = retries;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    /// Transport settings derived from this config.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            handshake_timeout: self.handshake_timeout,
            handshake_retries: self.handshake_retries,
            handshake_backoff: BackoffPolicy::exact(
                Duration::from_millis(100),
                self.handshake_timeout.max(Duration::from_millis(100)),
            ),
            ..TransportConfig::default()
        }
    }

    /// Lifecycle settings derived from this config.
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_ttl: self.heartbeat_ttl,
            reconcile_interval: self.heartbeat_interval,
            heartbeat_retry_delay: (self.heartbeat_interval / 5).max(Duration::from_millis(10)),
            request_timeout: self.request_timeout,
            unregister_timeout: Duration::from_secs(1),
            dial_max_retries: DEFAULT_MAX_RETRIES,
            dial_retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}
