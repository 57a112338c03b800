//! Chain state values produced at the end of a state sync.
//!
//! These are owned by external collaborators (the light client that vouches
//! for a height, the block store that persists them). Braid only carries them
//! from the state provider back to the caller of a sync.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{Ed25519PublicKey, Ed25519Signature};

/// Application state hash as reported by the application.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AppHash(pub Bytes);

impl AppHash {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for AppHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppHash({})", self.to_hex())
    }
}

impl fmt::Display for AppHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The chain state a node bootstraps from after restoring a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub chain_id: String,
    pub initial_height: u64,
    pub last_block_height: u64,
    pub last_block_hash: Bytes,
    pub app_hash: AppHash,
    pub app_version: u64,
}

/// A validator's signature over a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    pub validator: Ed25519PublicKey,
    pub timestamp: i64,
    pub signature: Ed25519Signature,
}

/// The commit for the block at the snapshot height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub height: u64,
    pub round: u32,
    pub block_hash: Bytes,
    pub signatures: Vec<CommitSig>,
}
