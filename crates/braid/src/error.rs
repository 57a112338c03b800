//! Error types for the node.

use braid_core::CoreError;
use braid_p2p::P2pError;
use braid_statesync::StateSyncError;
use braid_store::StoreError;
use thiserror::Error;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),

    #[error("state sync error: {0}")]
    StateSync(#[from] StateSyncError),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
