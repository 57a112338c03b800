//! Error types for state sync.

use braid_core::AppHash;
use braid_p2p::P2pError;
use thiserror::Error;

/// Errors that can occur while serving or running a state sync.
#[derive(Debug, Error)]
pub enum StateSyncError {
    /// Another sync owns the session slot.
    #[error("a state sync is already in progress")]
    SyncInProgress,

    /// Discovery ended without a usable snapshot.
    #[error("no suitable snapshot found")]
    NoSnapshots,

    /// Every peer advertising the selected snapshot went away.
    #[error("no peers left to fetch chunks from")]
    NoPeers,

    /// A chunk kept failing.
    #[error("chunk {index} failed after {attempts} attempts")]
    ChunkRetriesExhausted { index: u32, attempts: u32 },

    /// A chunk does not fit the selected snapshot.
    #[error("chunk mismatch: {0}")]
    ChunkMismatch(String),

    /// The restored application disagrees with the trusted hash.
    #[error("app hash mismatch: expected {expected}, got {actual}")]
    AppHashMismatch { expected: AppHash, actual: AppHash },

    /// A peer sent a malformed message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The local application failed.
    #[error("application error: {0}")]
    App(String),

    /// The state provider failed.
    #[error("state provider error: {0}")]
    StateProvider(String),

    /// The reactor shut down mid-sync.
    #[error("state sync cancelled")]
    Cancelled,

    /// Routing failure.
    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),
}

impl StateSyncError {
    pub(crate) fn app(err: anyhow::Error) -> Self {
        Self::App(format!("{:#}", err))
    }

    pub(crate) fn provider(err: anyhow::Error) -> Self {
        Self::StateProvider(format!("{:#}", err))
    }
}

/// Result type for state sync operations.
pub type Result<T> = std::result::Result<T, StateSyncError>;
