//! Node configuration
//!
//! Every section has defaults, so a JSON file only needs the fields it
//! changes. `{}` is a valid configuration: host 1, binary wire, a server on
//! an ephemeral local port and no peers.

use std::path::Path;
use std::time::Duration;

use kvtree_core_store::{Error, HostId, Result};
use kvtree_replication::ReplicationOptions;
use kvtree_server::ServerOptions;
use kvtree_wire::{ConnectionOptions, WireType, DEFAULT_MAX_FRAME};
use serde::{Deserialize, Serialize};

/// Top-level configuration of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub replication: ReplicationConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::invalid_argument(format!("invalid configuration: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Self::from_json_str(&json)
    }
}

/// Outgoing connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a call waits for its reply, in milliseconds.
    pub call_timeout_ms: u64,
    pub wire: WireType,
    pub max_frame: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            wire: WireType::default(),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            codec: self.wire.codec(),
            call_timeout: self.call_timeout(),
            max_frame: self.max_frame,
        }
    }
}

/// The listening side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub wire: WireType,
    pub max_frame: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            wire: WireType::default(),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ServerConfig {
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            codec: self.wire.codec(),
            max_frame: self.max_frame,
        }
    }
}

/// Which resources this host replicates, and with whom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This host's identifier, 0 to 127. Must differ from every peer's.
    pub host_id: u8,
    /// Addresses of the peers this host connects to.
    pub peers: Vec<String>,
    /// Resource paths replicated with every peer.
    pub paths: Vec<String>,
    /// Delay before reconnecting a lost session, in milliseconds.
    pub reconnect_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            host_id: 1,
            peers: Vec::new(),
            paths: Vec::new(),
            reconnect_interval_ms: 1_000,
        }
    }
}

impl ReplicationConfig {
    pub fn host_id(&self) -> Result<HostId> {
        HostId::new(self.host_id)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Hub options, connecting the way `client` does.
    pub fn replication_options(&self, client: &ClientConfig) -> ReplicationOptions {
        ReplicationOptions {
            connection: client.connection_options(),
            reconnect_interval: self.reconnect_interval(),
        }
    }
}
