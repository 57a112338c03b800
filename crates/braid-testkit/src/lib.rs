//! # Braid Testkit
//!
//! Testing utilities for Braid.
//!
//! ## Overview
//!
//! - **Fixtures**: [`MockApp`] and [`MockStateProvider`] stand in for the
//!   application and the light client; [`TestNetwork`] runs full nodes over
//!   an in-memory network
//! - **Generators**: proptest strategies for peer ids, snapshots and
//!   state sync messages
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use braid_testkit::{MockApp, MockStateProvider, SnapshotFixture, TestNetwork};
//!
//! async fn example() -> braid::Result<()> {
//!     let fixture = SnapshotFixture::new(100, 1, 3);
//!     let mut net = TestNetwork::new();
//!     let server = net.add_node(MockApp::with_snapshot(&fixture)).await?;
//!     let client = net.add_node(MockApp::new()).await?;
//!     net.connect(client, server).await?;
//!
//!     let provider = Arc::new(MockStateProvider::trusting(&fixture));
//!     let discovery = net.node(client).state_sync_handle().config().discovery_time;
//!     net.node(client).state_sync(provider, discovery).await?;
//!     net.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use braid_testkit::generators::{peer_id, snapshot};
//!
//! proptest! {
//!     #[test]
//!     fn pool_keeps_best(peer in peer_id(), s in snapshot()) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    app_hash_of, fast_state_sync, keypair, keypairs, MockApp, MockStateProvider, SnapshotFixture,
    TestNetwork,
};
