//! # Braid State Sync
//!
//! Bootstraps a node from an application snapshot instead of replaying the
//! chain from genesis.
//!
//! ## Overview
//!
//! Every node runs a [`Reactor`] that answers snapshot and chunk requests
//! from peers. A node that needs to catch up calls
//! [`StateSyncHandle::sync`], which:
//!
//! 1. asks every peer for its recent snapshots and collects the answers for
//!    a discovery window,
//! 2. picks the best snapshot (highest height, then highest format),
//! 3. fetches its chunks from the peers that advertised it, retrying
//!    elsewhere on timeouts and missing chunks,
//! 4. hands the assembled snapshot to the application and checks the
//!    resulting app hash against a trusted [`StateProvider`].
//!
//! Only one sync runs at a time.
//!
//! ## Channels
//!
//! | id | carries | priority |
//! |---|---|---|
//! | `0x60` | `SnapshotsRequest`, `SnapshotsResponse` | 6 |
//! | `0x61` | `ChunkRequest`, `ChunkResponse` | 3 |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use braid_p2p::Router;
//! use braid_statesync::{Reactor, SnapshotApp, StateProvider, StateSyncConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn bootstrap(
//!     router: &Router,
//!     app: Arc<dyn SnapshotApp>,
//!     provider: Arc<dyn StateProvider>,
//! ) -> braid_statesync::Result<()> {
//!     let cancel = CancellationToken::new();
//!     let (reactor, handle) =
//!         Reactor::open(router, app, StateSyncConfig::default(), cancel).await?;
//!     tokio::spawn(reactor.run());
//!
//!     let (state, _commit) = handle.sync(provider, Duration::from_secs(15)).await?;
//!     println!("synced to height {}", state.last_block_height);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod chunks;
pub mod config;
pub mod error;
pub mod messages;
pub mod reactor;
pub mod snapshots;
pub mod syncer;

pub use app::{RestoredSnapshot, SnapshotApp, StateProvider};
pub use chunks::ChunkQueue;
pub use config::StateSyncConfig;
pub use error::{Result, StateSyncError};
pub use messages::{
    chunk_channel, snapshot_channel, ChunkRequest, ChunkResponse, Message, SnapshotsRequest,
    SnapshotsResponse, StateSyncMessage, CHUNK_CHANNEL, RECENT_SNAPSHOTS, SNAPSHOT_CHANNEL,
};
pub use reactor::{Reactor, StateSyncHandle};
pub use snapshots::SnapshotPool;
pub use syncer::SyncPhase;
