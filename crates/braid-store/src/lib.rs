//! # Braid Store
//!
//! Persistence for the peer directory. The router's peer manager writes every
//! status change through the [`PeerStore`] trait so that banned peers stay
//! banned and known addresses survive a restart.
//!
//! ## Key Types
//!
//! - [`PeerStore`] - The async trait for peer persistence
//! - [`SqlitePeerStore`] - SQLite-based persistent storage
//! - [`MemoryPeerStore`] - In-memory storage for tests and ephemeral nodes
//! - [`PeerRecord`] - The persisted view of one peer
//!
//! ## Usage
//!
//! ```rust,no_run
//! use braid_store::{PeerStore, SqlitePeerStore};
//!
//! async fn example() {
//!     let store = SqlitePeerStore::open("peers.db").unwrap();
//!     let peers = store.load_peers().await.unwrap();
//!     println!("{} known peers", peers.len());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryPeerStore;
pub use sqlite::SqlitePeerStore;
pub use traits::{PeerRecord, PeerStore};
