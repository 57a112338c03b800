//! PeerStore trait: the abstract interface for peer persistence.

use async_trait::async_trait;
use braid_core::{PeerAddress, PeerId, PeerStatus};

use crate::error::Result;

/// The persisted view of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Every address the peer has been reached at or configured with.
    pub addresses: Vec<PeerAddress>,
    pub status: PeerStatus,
    /// Dial priority; higher is dialed first.
    pub priority: u8,
    /// Configured peers are always redialed and never garbage-collected.
    pub persistent: bool,
    /// Last successful connection (Unix ms).
    pub last_connected: Option<i64>,
}

impl PeerRecord {
    /// A freshly discovered peer.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addresses: Vec::new(),
            status: PeerStatus::New,
            priority: 0,
            persistent: false,
            last_connected: None,
        }
    }
}

/// Async interface for peer persistence.
///
/// - **Upserts replace**: `upsert_peer` overwrites the whole record, including
///   its address list.
/// - **Removal is idempotent**: removing an unknown peer returns `false`.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Load every stored peer.
    async fn load_peers(&self) -> Result<Vec<PeerRecord>>;

    /// Get one peer.
    async fn get_peer(&self, id: &PeerId) -> Result<Option<PeerRecord>>;

    /// Insert or replace a peer record.
    async fn upsert_peer(&self, record: &PeerRecord) -> Result<()>;

    /// Delete a peer. Returns whether it existed.
    async fn remove_peer(&self, id: &PeerId) -> Result<bool>;

    /// All peers whose status is `Banned`.
    async fn banned_peers(&self) -> Result<Vec<PeerId>> {
        Ok(self
            .load_peers()
            .await?
            .into_iter()
            .filter(|p| p.status == PeerStatus::Banned)
            .map(|p| p.id)
            .collect())
    }
}
