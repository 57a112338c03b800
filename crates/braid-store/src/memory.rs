//! In-memory implementation of the PeerStore trait.
//!
//! Same semantics as SQLite, nothing persisted.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use braid_core::PeerId;

use crate::error::{Result, StoreError};
use crate::traits::{PeerRecord, PeerStore};

/// In-memory peer store. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryPeerStore {
    peers: RwLock<BTreeMap<PeerId, PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn load_peers(&self) -> Result<Vec<PeerRecord>> {
        let peers = self.peers.read().map_err(|_| StoreError::Poisoned)?;
        Ok(peers.values().cloned().collect())
    }

    async fn get_peer(&self, id: &PeerId) -> Result<Option<PeerRecord>> {
        let peers = self.peers.read().map_err(|_| StoreError::Poisoned)?;
        Ok(peers.get(id).cloned())
    }

    async fn upsert_peer(&self, record: &PeerRecord) -> Result<()> {
        let mut peers = self.peers.write().map_err(|_| StoreError::Poisoned)?;
        peers.insert(record.id, record.clone());
        Ok(())
    }

    async fn remove_peer(&self, id: &PeerId) -> Result<bool> {
        let mut peers = self.peers.write().map_err(|_| StoreError::Poisoned)?;
        Ok(peers.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::PeerStatus;

    #[tokio::test]
    async fn test_upsert_and_load() {
        let store = MemoryPeerStore::new();
        let mut record = PeerRecord::new(PeerId::from_bytes([1; 20]));
        store.upsert_peer(&record).await.unwrap();

        record.status = PeerStatus::Banned;
        store.upsert_peer(&record).await.unwrap();

        let peers = store.load_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Banned);
        assert_eq!(store.banned_peers().await.unwrap(), vec![record.id]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = MemoryPeerStore::new();
        let id = PeerId::from_bytes([2; 20]);
        store.upsert_peer(&PeerRecord::new(id)).await.unwrap();
        assert!(store.remove_peer(&id).await.unwrap());
        assert!(!store.remove_peer(&id).await.unwrap());
        assert!(store.get_peer(&id).await.unwrap().is_none());
    }
}
