//! State sync wire messages and channel descriptors.
//!
//! Both channels carry the same tagged union. On the wire every message is a
//! [`Message`] whose `sum` holds exactly one [`StateSyncMessage`]; an empty
//! `sum` fails to unwrap and is treated like any other undecodable payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use braid_core::Snapshot;
use braid_p2p::{ChannelDescriptor, ChannelMessage, UnwrapError};

use crate::error::{Result, StateSyncError};

/// Snapshot metadata exchange.
pub const SNAPSHOT_CHANNEL: u16 = 0x60;
/// Chunk contents exchange.
pub const CHUNK_CHANNEL: u16 = 0x61;

/// Snapshots advertised per request.
pub const RECENT_SNAPSHOTS: usize = 10;

/// Largest message accepted on the snapshot channel.
pub const SNAPSHOT_MSG_SIZE: usize = 4 * 1024 * 1024;
/// Largest message accepted on the chunk channel.
pub const CHUNK_MSG_SIZE: usize = 16 * 1024 * 1024;

pub fn snapshot_channel() -> ChannelDescriptor {
    ChannelDescriptor::new(SNAPSHOT_CHANNEL)
        .with_priority(6)
        .with_send_queue_capacity(10)
        .with_recv_message_capacity(SNAPSHOT_MSG_SIZE)
}

pub fn chunk_channel() -> ChannelDescriptor {
    ChannelDescriptor::new(CHUNK_CHANNEL)
        .with_priority(3)
        .with_send_queue_capacity(4)
        .with_recv_message_capacity(CHUNK_MSG_SIZE)
}

/// Ask a peer for its recent snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotsRequest {}

/// One advertised snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotsResponse {
    pub height: u64,
    pub format: u32,
    pub chunks: u32,
    pub hash: Bytes,
    pub metadata: Bytes,
}

impl From<Snapshot> for SnapshotsResponse {
    fn from(s: Snapshot) -> Self {
        Self {
            height: s.height,
            format: s.format,
            chunks: s.chunks,
            hash: s.hash,
            metadata: s.metadata,
        }
    }
}

impl From<SnapshotsResponse> for Snapshot {
    fn from(r: SnapshotsResponse) -> Self {
        Self {
            height: r.height,
            format: r.format,
            chunks: r.chunks,
            hash: r.hash,
            metadata: r.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub height: u64,
    pub format: u32,
    pub index: u32,
}

/// A chunk, or a notice that the peer does not have it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub height: u64,
    pub format: u32,
    pub index: u32,
    pub chunk: Bytes,
    pub missing: bool,
}

/// Every state sync message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateSyncMessage {
    SnapshotsRequest(SnapshotsRequest),
    SnapshotsResponse(SnapshotsResponse),
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
}

impl StateSyncMessage {
    /// Check the fields a well-behaved peer always fills in.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(StateSyncError::InvalidMessage(reason.to_string()));
        match self {
            Self::SnapshotsRequest(_) => Ok(()),
            Self::SnapshotsResponse(r) => {
                if r.height == 0 {
                    return invalid("snapshot height cannot be 0");
                }
                if r.chunks == 0 {
                    return invalid("snapshot has no chunks");
                }
                if r.hash.is_empty() {
                    return invalid("snapshot has no hash");
                }
                Ok(())
            }
            Self::ChunkRequest(r) => {
                if r.height == 0 {
                    return invalid("chunk request height cannot be 0");
                }
                Ok(())
            }
            Self::ChunkResponse(r) => {
                if r.height == 0 {
                    return invalid("chunk response height cannot be 0");
                }
                if r.missing && !r.chunk.is_empty() {
                    return invalid("missing chunk cannot have contents");
                }
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SnapshotsRequest(_) => "SnapshotsRequest",
            Self::SnapshotsResponse(_) => "SnapshotsResponse",
            Self::ChunkRequest(_) => "ChunkRequest",
            Self::ChunkResponse(_) => "ChunkResponse",
        }
    }
}

/// Wire wrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sum: Option<StateSyncMessage>,
}

impl ChannelMessage for StateSyncMessage {
    type Wire = Message;

    fn wrap(self) -> Message {
        Message { sum: Some(self) }
    }

    fn unwrap(wire: Message) -> std::result::Result<Self, UnwrapError> {
        wire.sum
            .ok_or_else(|| UnwrapError("empty state sync message".into()))
    }
}
