//! Error types for the p2p layer.

use thiserror::Error;

use braid_core::{PeerId, PeerStatus};

use crate::channel::ChannelId;

/// Errors that can occur in transports, channels and the router.
#[derive(Debug, Error)]
pub enum P2pError {
    /// The connection is closed or was never established.
    #[error("connection closed")]
    ConnectionClosed,

    /// A stream id is already held by another handle on this connection.
    #[error("stream {0} already in use")]
    StreamInUse(u16),

    /// The transport has been closed.
    #[error("transport closed")]
    TransportClosed,

    /// No transport speaks this protocol.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Dialing an endpoint failed.
    #[error("dial {endpoint} failed: {reason}")]
    Dial { endpoint: String, reason: String },

    /// The connection handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The remote key does not belong to the expected peer.
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    /// A channel with this id is already open.
    #[error("channel {0} already open")]
    ChannelInUse(ChannelId),

    /// The channel was closed by its owner or by the router.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer is not in the directory.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The peer is banned.
    #[error("peer {0} is banned")]
    PeerBanned(PeerId),

    /// The peer already has a live connection.
    #[error("peer {0} already connected")]
    AlreadyConnected(PeerId),

    /// The connection limit was reached.
    #[error("maximum number of connected peers reached")]
    MaxConnections,

    /// The remote is ourselves.
    #[error("refusing connection to self")]
    SelfConnection,

    /// A status change that the lifecycle forbids.
    #[error("peer {peer} cannot move from {from} to {to}")]
    InvalidTransition {
        peer: PeerId,
        from: PeerStatus,
        to: PeerStatus,
    },

    /// A reassembled message exceeded the configured bound.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Payload could not be decoded into the channel's message type.
    #[error("decode error: {0}")]
    Decode(String),

    /// Name resolution failed.
    #[error("resolve {address}: {reason}")]
    Resolve { address: String, reason: String },

    /// Timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Core error.
    #[error(transparent)]
    Core(#[from] braid_core::CoreError),

    /// Peer store failed.
    #[error("peer store error: {0}")]
    Store(#[from] braid_store::StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for p2p operations.
pub type Result<T> = std::result::Result<T, P2pError>;
