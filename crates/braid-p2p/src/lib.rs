//! # Braid P2P
//!
//! Peer-to-peer plumbing for Braid nodes: transports, stream multiplexing,
//! typed message channels, peer lifecycle and the router tying them together.
//!
//! ## Overview
//!
//! A [`Router`] owns a set of [`Transport`]s and a [`PeerManager`]. It dials
//! and accepts connections, and moves messages between connections and the
//! [`Channel`]s that reactors open on it. Reactors never see connections:
//! they send and receive [`Envelope`]s addressed by [`PeerId`](braid_core::PeerId)
//! and watch peers come and go through [`PeerUpdates`].
//!
//! ## Key Types
//!
//! - [`Channel`] / [`ChannelSender`] - Typed message queues keyed by [`ChannelId`]
//! - [`Envelope`] - A message plus its sender or destination
//! - [`PeerError`] - A reactor's complaint about a peer
//! - [`PeerManager`] - Peer address book, dial scheduling and status transitions
//! - [`Transport`] / [`Connection`] - In-memory and TCP ([`MConnTransport`]) links
//! - [`Multiplexer`] - Independent ordered streams over one connection
//! - [`LegacyBridge`] - Runs channel-based reactors under a callback switch
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use braid_core::Keypair;
//! use braid_p2p::{
//!     ChannelDescriptor, MemoryNetwork, PeerManager, PeerManagerOptions, Router,
//!     RouterOptions, Transport,
//! };
//! use braid_store::MemoryPeerStore;
//!
//! # async fn run() -> braid_p2p::Result<()> {
//! let keypair = Keypair::generate();
//! let network = MemoryNetwork::new();
//! let transport: Arc<dyn Transport> = Arc::new(network.create_transport(&keypair).await);
//!
//! let store = Arc::new(MemoryPeerStore::new());
//! let peers = PeerManager::load(keypair.peer_id(), store, PeerManagerOptions::default()).await?;
//! let router = Router::new(&keypair, vec![transport], Arc::new(peers), RouterOptions::default())?;
//!
//! // let channel = router.open_channel::<MyMessage>(ChannelDescriptor::new(0x60))?;
//! router.start()?;
//! # let _ = ChannelDescriptor::new(0x60);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod legacy;
pub mod mux;
pub mod peer_manager;
pub mod resolve;
pub mod router;
pub mod scheduler;
pub mod transport;

pub use channel::{
    decode_message, encode_message, Channel, ChannelDescriptor, ChannelId, ChannelMessage,
    ChannelSender, Envelope, PeerError, PeerErrorAction, UnwrapError,
};
pub use codec::CborCodec;
pub use error::{P2pError, Result};
pub use legacy::{LegacyBridge, LegacyReactor, LegacySwitch};
pub use mux::{Frame, Multiplexer, Stream, StreamId, StreamReceiver, StreamSender};
pub use peer_manager::{DialCandidate, PeerInfo, PeerManager, PeerManagerOptions, PeerUpdate, PeerUpdates};
pub use resolve::resolve;
pub use router::{Router, RouterOptions};
pub use scheduler::Scheduler;
pub use transport::mconn::{MConnConfig, MConnTransport};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::{Connection, Transport};
