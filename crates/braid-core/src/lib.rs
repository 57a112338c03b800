//! # Braid Core
//!
//! Pure primitives shared by every Braid crate: node identity, transport
//! endpoints, snapshot and chunk records, and the chain-state values handed
//! back to the node after a state sync.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`PeerId`] - Opaque node identifier derived from an Ed25519 public key
//! - [`Endpoint`] / [`PeerAddress`] - Where and how to reach a peer
//! - [`Snapshot`] / [`SnapshotKey`] - A point-in-time application checkpoint
//! - [`Chunk`] - One indexed piece of a snapshot
//! - [`ChainState`] / [`Commit`] - Output of a successful state sync
//!
//! ## Encoding
//!
//! Wire payloads are CBOR, see [`codec`].

pub mod codec;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod peer;
pub mod snapshot;
pub mod state;

pub use codec::{decode, encode};
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use endpoint::{Endpoint, PeerAddress, Protocol};
pub use error::{CoreError, Result};
pub use peer::{PeerId, PeerStatus};
pub use snapshot::{Chunk, Snapshot, SnapshotKey};
pub use state::{AppHash, ChainState, Commit, CommitSig};
