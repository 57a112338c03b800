//! The Node: a router with the state sync reactor attached.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use braid_core::{ChainState, Commit, Endpoint, Keypair, PeerAddress, PeerId};
use braid_p2p::{MConnTransport, PeerInfo, PeerManager, Router, Transport};
use braid_statesync::{Reactor, SnapshotApp, StateProvider, StateSyncHandle, SyncPhase};
use braid_store::{MemoryPeerStore, PeerStore, SqlitePeerStore};

use crate::config::NodeConfig;
use crate::error::Result;

/// A running Braid node.
///
/// Owns the router, its transports and the state sync reactor. Dropping the
/// node cancels everything; [`Node::stop`] also waits for the tasks to end.
pub struct Node {
    peer_id: PeerId,
    router: Router,
    state_sync: StateSyncHandle,
    reactor: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Node {
    /// Start a node on TCP, listening on `config.listen_addresses`.
    pub async fn start(
        keypair: Keypair,
        config: NodeConfig,
        app: Arc<dyn SnapshotApp>,
    ) -> Result<Self> {
        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        for addr in &config.listen_addresses {
            let transport =
                MConnTransport::listen(keypair.clone(), config.mconn.clone(), *addr).await?;
            transports.push(Arc::new(transport));
        }
        if transports.is_empty() {
            transports.push(Arc::new(MConnTransport::new(
                keypair.clone(),
                config.mconn.clone(),
            )));
        }
        Self::with_transports(keypair, config, transports, app).await
    }

    /// Start a node over the given transports.
    pub async fn with_transports(
        keypair: Keypair,
        config: NodeConfig,
        transports: Vec<Arc<dyn Transport>>,
        app: Arc<dyn SnapshotApp>,
    ) -> Result<Self> {
        let peer_id = keypair.peer_id();
        let store: Arc<dyn PeerStore> = match &config.peer_db {
            Some(path) => Arc::new(SqlitePeerStore::open(path)?),
            None => Arc::new(MemoryPeerStore::new()),
        };

        let mut peer_options = config.peers.clone();
        peer_options
            .persistent_peers
            .extend(config.persistent_peers.iter().map(|a| a.peer_id));
        let peer_manager = Arc::new(PeerManager::load(peer_id, store, peer_options).await?);
        for address in &config.persistent_peers {
            peer_manager.add_persistent(address.clone()).await?;
        }

        let router = Router::new(&keypair, transports, peer_manager, config.router.clone())?;
        let cancel = CancellationToken::new();
        let (reactor, state_sync) = Reactor::open(
            &router,
            app,
            config.state_sync.clone(),
            cancel.child_token(),
        )
        .await?;
        let reactor = Some(tokio::spawn(reactor.run()));
        router.start()?;

        tracing::info!(node = %peer_id, endpoints = ?router.endpoints(), "node started");
        Ok(Self {
            peer_id,
            router,
            state_sync,
            reactor,
            cancel,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Endpoints other nodes can dial.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.router.endpoints()
    }

    /// Addresses other nodes can use to reach this one.
    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.endpoints()
            .iter()
            .map(|e| PeerAddress::from_endpoint(self.peer_id, e))
            .collect()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Learn a peer address; the router dials it when it has capacity.
    pub async fn add_peer(&self, address: PeerAddress) -> Result<bool> {
        Ok(self.router.add_address(address).await?)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.router.connected_peers()
    }

    /// Snapshot of every known peer.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.router.peer_manager().peers().await
    }

    /// Bootstrap application state from a peer snapshot.
    ///
    /// Returns the chain state and commit at the restored height. The caller
    /// persists them before starting consensus.
    pub async fn state_sync(
        &self,
        provider: Arc<dyn StateProvider>,
        discovery_time: Duration,
    ) -> Result<(ChainState, Commit)> {
        Ok(self.state_sync.sync(provider, discovery_time).await?)
    }

    pub fn state_sync_phase(&self) -> SyncPhase {
        self.state_sync.phase()
    }

    /// A handle for starting syncs from other tasks.
    pub fn state_sync_handle(&self) -> StateSyncHandle {
        self.state_sync.clone()
    }

    /// Stop the reactor and the router, and wait for their tasks.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.router.stop().await;
        if let Some(reactor) = self.reactor.take() {
            if let Err(e) = reactor.await {
                tracing::warn!(err = %e, "state sync reactor task failed");
            }
        }
        tracing::info!(node = %self.peer_id, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
