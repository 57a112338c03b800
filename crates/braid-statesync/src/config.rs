//! State sync configuration.

use std::time::Duration;

/// Tuning for the syncer.
#[derive(Debug, Clone)]
pub struct StateSyncConfig {
    /// How long to collect snapshot advertisements before choosing one.
    pub discovery_time: Duration,
    /// How long a chunk request may stay unanswered.
    pub chunk_request_timeout: Duration,
    /// Chunk requests outstanding at once.
    pub chunk_fetchers: usize,
    /// Failed attempts allowed per chunk before the sync gives up. A peer
    /// accumulating more failures than this stops being asked for chunks.
    pub max_chunk_retries: u32,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            discovery_time: Duration::from_secs(15),
            chunk_request_timeout: Duration::from_secs(10),
            chunk_fetchers: 4,
            max_chunk_retries: 5,
        }
    }
}
