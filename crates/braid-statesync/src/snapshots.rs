//! The pool of snapshots discovered from peers.

use std::collections::{BTreeSet, HashMap};

use braid_core::{PeerId, Snapshot, SnapshotKey};

#[derive(Debug)]
struct Entry {
    snapshot: Snapshot,
    peers: BTreeSet<PeerId>,
}

/// Advertised snapshots, deduplicated by [`SnapshotKey`].
///
/// Each entry remembers every peer that advertised it. An entry whose last
/// advertiser goes away is forgotten.
#[derive(Debug, Default)]
pub struct SnapshotPool {
    entries: HashMap<SnapshotKey, Entry>,
}

impl SnapshotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` offers `snapshot`. Returns `true` if the snapshot
    /// was not known before.
    pub fn add(&mut self, peer: PeerId, snapshot: Snapshot) -> bool {
        match self.entries.get_mut(&snapshot.key()) {
            Some(entry) => {
                entry.peers.insert(peer);
                false
            }
            None => {
                let mut peers = BTreeSet::new();
                peers.insert(peer);
                self.entries.insert(snapshot.key(), Entry { snapshot, peers });
                true
            }
        }
    }

    /// The preferred snapshot: highest height, then highest format.
    pub fn best(&self) -> Option<Snapshot> {
        self.ranked().into_iter().next()
    }

    /// All snapshots, best first. Ties on `(height, format)` are ordered by
    /// hash so the result is deterministic.
    pub fn ranked(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> =
            self.entries.values().map(|e| e.snapshot.clone()).collect();
        snapshots.sort_by(|a, b| a.rank_cmp(b).then_with(|| a.hash.cmp(&b.hash)));
        snapshots
    }

    /// Peers advertising `key`.
    pub fn peers(&self, key: &SnapshotKey) -> Vec<PeerId> {
        self.entries
            .get(key)
            .map(|e| e.peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forget everything `peer` advertised.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.entries.retain(|_, entry| {
            entry.peers.remove(peer);
            !entry.peers.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
