//! Peer identity and lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::Ed25519PublicKey;
use crate::error::CoreError;

/// Length of a peer identifier in bytes.
pub const PEER_ID_LEN: usize = 20;

/// A 20-byte node identifier.
///
/// Derived as the first 20 bytes of `Blake3("braid-node-id-v0:" || public_key)`.
/// Immutable once assigned; the transport handshake binds it to the key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_LEN]);

impl PeerId {
    /// Derive the identifier owned by a public key.
    pub fn from_public_key(key: &Ed25519PublicKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"braid-node-id-v0:");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&digest.as_bytes()[..PEER_ID_LEN]);
        Self(id)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidPeerId(e.to_string()))?;
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidPeerId(format!("expected {} bytes", PEER_ID_LEN)))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Lifecycle status of a peer as seen by the local node.
///
/// Transitions: `New -> Up -> Down -> (Up | Removed | Banned)`. `Banned` is
/// terminal; a banned peer is never dialed or accepted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Known but never connected.
    New,
    /// Connected and routing.
    Up,
    /// Previously connected, currently not.
    Down,
    /// Dropped from the directory.
    Removed,
    /// Banned for misbehaviour.
    Banned,
}

impl PeerStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: PeerStatus) -> bool {
        use PeerStatus::*;
        match (self, next) {
            (Banned, _) => false,
            (New, Up) | (New, Removed) | (New, Banned) => true,
            (Up, Down) | (Up, Banned) => true,
            (Down, Up) | (Down, Removed) | (Down, Banned) => true,
            (Removed, New) => true,
            _ => false,
        }
    }

    /// Whether the peer may be dialed or accepted in this state.
    pub fn is_connectable(self) -> bool {
        matches!(self, PeerStatus::New | PeerStatus::Down)
    }

    /// Stable integer code, used by persistent peer stores.
    pub fn to_u8(self) -> u8 {
        match self {
            PeerStatus::New => 0,
            PeerStatus::Up => 1,
            PeerStatus::Down => 2,
            PeerStatus::Removed => 3,
            PeerStatus::Banned => 4,
        }
    }

    /// Inverse of [`PeerStatus::to_u8`].
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PeerStatus::New),
            1 => Some(PeerStatus::Up),
            2 => Some(PeerStatus::Down),
            3 => Some(PeerStatus::Removed),
            4 => Some(PeerStatus::Banned),
            _ => None,
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::New => "new",
            PeerStatus::Up => "up",
            PeerStatus::Down => "down",
            PeerStatus::Removed => "removed",
            PeerStatus::Banned => "banned",
        };
        f.write_str(s)
    }
}
