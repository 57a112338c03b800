//! Node configuration.
//!
//! [`NodeConfig`] is built in code or loaded from a JSON file. The file
//! format flattens the most commonly tuned knobs; everything else keeps its
//! default.
//!
//! ```json
//! {
//!   "listen_addresses": ["0.0.0.0:26656"],
//!   "persistent_peers": ["mconn://<peer-id>@seed.example.com:26656"],
//!   "peer_db": "data/peers.db",
//!   "max_connected": 32,
//!   "discovery_time_secs": 15,
//!   "chunk_request_timeout_secs": 10,
//!   "chunk_fetchers": 4
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use braid_core::PeerAddress;
use braid_p2p::{MConnConfig, PeerManagerOptions, RouterOptions};
use braid_statesync::StateSyncConfig;

use crate::error::{NodeError, Result};

/// Everything needed to start a [`Node`](crate::Node).
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// TCP addresses to accept connections on. Empty means dial-only.
    pub listen_addresses: Vec<SocketAddr>,
    /// Peers that are always redialed.
    pub persistent_peers: Vec<PeerAddress>,
    /// SQLite peer database. `None` keeps the peer directory in memory.
    pub peer_db: Option<PathBuf>,
    pub router: RouterOptions,
    pub peers: PeerManagerOptions,
    pub mconn: MConnConfig,
    pub state_sync: StateSyncConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    listen_addresses: Vec<SocketAddr>,
    persistent_peers: Vec<String>,
    peer_db: Option<PathBuf>,
    max_connected: Option<usize>,
    max_packet_payload: Option<usize>,
    discovery_time_secs: Option<u64>,
    chunk_request_timeout_secs: Option<u64>,
    chunk_fetchers: Option<usize>,
    max_chunk_retries: Option<u32>,
}

impl NodeConfig {
    /// Parse a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| NodeError::Config(e.to_string()))?;

        let mut config = NodeConfig {
            listen_addresses: file.listen_addresses,
            peer_db: file.peer_db,
            ..NodeConfig::default()
        };
        for peer in &file.persistent_peers {
            config.persistent_peers.push(PeerAddress::parse(peer)?);
        }
        if let Some(max) = file.max_connected {
            config.peers.max_connected = max;
        }
        if let Some(payload) = file.max_packet_payload {
            if payload == 0 {
                return Err(NodeError::Config("max_packet_payload must be positive".into()));
            }
            config.mconn.max_packet_payload = payload;
        }
        if let Some(secs) = file.discovery_time_secs {
            config.state_sync.discovery_time = Duration::from_secs(secs);
        }
        if let Some(secs) = file.chunk_request_timeout_secs {
            config.state_sync.chunk_request_timeout = Duration::from_secs(secs);
        }
        if let Some(fetchers) = file.chunk_fetchers {
            if fetchers == 0 {
                return Err(NodeError::Config("chunk_fetchers must be positive".into()));
            }
            config.state_sync.chunk_fetchers = fetchers;
        }
        if let Some(retries) = file.max_chunk_retries {
            config.state_sync.max_chunk_retries = retries;
        }
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
