//! # Braid
//!
//! A peer-to-peer node that routes typed channel messages between peers and
//! bootstraps application state from snapshots held by the network.
//!
//! ## Overview
//!
//! - **Router**: owns the transports, dials and accepts peers, and moves
//!   envelopes between reactor channels and peer connections
//! - **Peer manager**: the peer directory, dial scheduling and the stream
//!   of peer status updates
//! - **State sync**: a reactor that serves local snapshots and chunks, and a
//!   syncer that discovers, fetches and restores a remote snapshot
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use braid::{Node, NodeConfig};
//! use braid::core::Keypair;
//! use braid::statesync::{SnapshotApp, StateProvider};
//!
//! async fn example(app: Arc<dyn SnapshotApp>, provider: Arc<dyn StateProvider>) -> braid::Result<()> {
//!     let mut config = NodeConfig::default();
//!     config.listen_addresses.push("0.0.0.0:26656".parse().unwrap());
//!
//!     let node = Node::start(Keypair::generate(), config, app).await?;
//!     let (state, commit) = node.state_sync(provider, Duration::from_secs(15)).await?;
//!     println!("restored height {} at round {}", state.last_block_height, commit.round);
//!
//!     node.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `braid::core` - identities, endpoints, snapshots and chain state
//! - `braid::store` - peer persistence
//! - `braid::p2p` - router, channels and transports
//! - `braid::statesync` - snapshot state sync

pub mod config;
pub mod error;
pub mod node;

pub use braid_core as core;
pub use braid_p2p as p2p;
pub use braid_statesync as statesync;
pub use braid_store as store;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::Node;

pub use braid_core::{
    AppHash, ChainState, Commit, Endpoint, Keypair, PeerAddress, PeerId, Snapshot,
};
pub use braid_statesync::{
    RestoredSnapshot, SnapshotApp, StateProvider, StateSyncConfig, StateSyncError, SyncPhase,
};
