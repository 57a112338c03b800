//! Collaborators the state sync reactor talks to.
//!
//! The application owns snapshots and applies restored state; the state
//! provider vouches for chain state at a height (typically a light client).
//! Both are external to Braid and return `anyhow` errors.

use async_trait::async_trait;
use bytes::Bytes;

use braid_core::{AppHash, ChainState, Commit, Snapshot};

/// A fully downloaded snapshot, ready to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSnapshot {
    pub snapshot: Snapshot,
    /// Chunk payloads in index order.
    pub chunks: Vec<Bytes>,
}

/// The application's snapshot interface.
#[async_trait]
pub trait SnapshotApp: Send + Sync {
    /// Snapshots available locally, in any order.
    async fn list_snapshots(&self) -> anyhow::Result<Vec<Snapshot>>;

    /// Load one chunk. `None` when the snapshot or chunk is not held.
    async fn load_chunk(&self, height: u64, format: u32, index: u32)
        -> anyhow::Result<Option<Bytes>>;

    /// Replace the application state with a restored snapshot and return
    /// the resulting app hash.
    async fn apply_restored_snapshot(&self, restored: RestoredSnapshot) -> anyhow::Result<AppHash>;
}

/// Trusted source of chain state.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// The app hash the application must report after restoring `height`.
    async fn app_hash(&self, height: u64) -> anyhow::Result<AppHash>;

    /// Chain state at `height`.
    async fn state(&self, height: u64) -> anyhow::Result<ChainState>;

    /// Commit for the block at `height`.
    async fn commit(&self, height: u64) -> anyhow::Result<Commit>;
}
