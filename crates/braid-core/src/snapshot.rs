//! Snapshots and chunks.
//!
//! A snapshot is a point-in-time checkpoint of application state, split into
//! `chunks` pieces. Two advertisements describe the same snapshot when their
//! [`SnapshotKey`] (height, format, hash) matches.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::peer::PeerId;

/// An application state snapshot descriptor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Block height the snapshot was taken at.
    pub height: u64,
    /// Application-specific serialization format.
    pub format: u32,
    /// Number of chunks.
    pub chunks: u32,
    /// Application-defined hash of the snapshot contents.
    pub hash: Bytes,
    /// Opaque application metadata.
    pub metadata: Bytes,
}

impl Snapshot {
    /// The identity used for deduplication.
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            height: self.height,
            format: self.format,
            hash: self.hash.clone(),
        }
    }

    /// Rank two snapshots: higher height first, then higher format.
    ///
    /// `Ordering::Less` means `self` is preferred.
    pub fn rank_cmp(&self, other: &Snapshot) -> Ordering {
        (other.height, other.format).cmp(&(self.height, self.format))
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("height", &self.height)
            .field("format", &self.format)
            .field("chunks", &self.chunks)
            .field("hash", &hex::encode(&self.hash))
            .finish()
    }
}

/// Identity of a snapshot for comparison purposes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub height: u64,
    pub format: u32,
    pub hash: Bytes,
}

impl fmt::Debug for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SnapshotKey({}/{}/{})",
            self.height,
            self.format,
            hex::encode(&self.hash)
        )
    }
}

/// One indexed piece of a snapshot's serialized content.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    pub height: u64,
    pub format: u32,
    pub index: u32,
    pub payload: Bytes,
    pub sender: PeerId,
}

impl Chunk {
    /// Whether this chunk belongs to the given snapshot's coordinates and range.
    pub fn belongs_to(&self, snapshot: &Snapshot) -> bool {
        self.height == snapshot.height
            && self.format == snapshot.format
            && self.index < snapshot.chunks
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("height", &self.height)
            .field("format", &self.format)
            .field("index", &self.index)
            .field("len", &self.payload.len())
            .field("sender", &self.sender)
            .finish()
    }
}
