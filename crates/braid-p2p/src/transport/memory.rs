//! In-process transport for tests and simulations.
//!
//! Nodes join a shared [`MemoryNetwork`] hub and dial each other by peer id
//! (`memory:<hex peer id>`). Connections are pairs of bounded channels, and
//! closing either end closes both.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use braid_core::{Ed25519PublicKey, Endpoint, Keypair, PeerId, Protocol};

use super::{Connection, MuxedConnection, Transport};
use crate::error::{P2pError, Result};
use crate::mux::Multiplexer;

/// Default per-direction channel capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 64;

struct NodeEntry {
    public_key: Ed25519PublicKey,
    incoming: mpsc::Sender<Arc<dyn Connection>>,
}

/// Shared state for an in-memory network.
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<PeerId, NodeEntry>>,
    buffer_size: usize,
}

impl MemoryNetwork {
    /// Create a new memory network.
    pub fn new() -> Arc<Self> {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a network whose connections buffer `buffer_size` frames per
    /// direction.
    pub fn with_buffer_size(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        })
    }

    /// Create a transport for `keypair` attached to this network.
    pub async fn create_transport(self: &Arc<Self>, keypair: &Keypair) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let peer_id = keypair.peer_id();

        self.nodes.write().await.insert(
            peer_id,
            NodeEntry {
                public_key: keypair.public_key(),
                incoming: tx,
            },
        );

        MemoryTransport {
            peer_id,
            public_key: keypair.public_key(),
            network: Arc::clone(self),
            incoming: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Peer ids currently attached.
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.nodes.read().await.keys().copied().collect()
    }

    async fn remove(&self, peer_id: &PeerId) {
        self.nodes.write().await.remove(peer_id);
    }
}

/// In-memory transport implementation.
pub struct MemoryTransport {
    peer_id: PeerId,
    public_key: Ed25519PublicKey,
    network: Arc<MemoryNetwork>,
    incoming: Mutex<mpsc::Receiver<Arc<dyn Connection>>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The endpoint other nodes dial to reach this one.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::local(Protocol::memory(), self.peer_id.to_hex())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn protocols(&self) -> Vec<Protocol> {
        vec![Protocol::memory()]
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![self.endpoint()]
    }

    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(P2pError::TransportClosed),
            conn = incoming.recv() => conn.ok_or(P2pError::TransportClosed),
        }
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>> {
        if self.closed.is_cancelled() {
            return Err(P2pError::TransportClosed);
        }
        if endpoint.protocol.as_str() != Protocol::MEMORY {
            return Err(P2pError::UnsupportedProtocol(endpoint.protocol.to_string()));
        }
        let dial_err = |reason: &str| P2pError::Dial {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };

        let path = endpoint.path.as_deref().ok_or_else(|| dial_err("missing path"))?;
        let target = PeerId::from_hex(path).map_err(|e| dial_err(&e.to_string()))?;
        if target == self.peer_id {
            return Err(P2pError::SelfConnection);
        }

        let (remote_key, incoming) = {
            let nodes = self.network.nodes.read().await;
            let node = nodes.get(&target).ok_or_else(|| dial_err("no such node"))?;
            (node.public_key, node.incoming.clone())
        };

        let buffer = self.network.buffer_size;
        let link = CancellationToken::new();
        let (local_tx, remote_rx) = mpsc::channel(buffer);
        let (remote_tx, local_rx) = mpsc::channel(buffer);

        let local = MuxedConnection {
            mux: Multiplexer::new(local_tx, local_rx, link.clone(), buffer),
            remote_key,
            local_endpoint: self.endpoint(),
            remote_endpoint: endpoint.clone(),
        };
        let remote = MuxedConnection {
            mux: Multiplexer::new(remote_tx, remote_rx, link, buffer),
            remote_key: self.public_key,
            local_endpoint: endpoint.clone(),
            remote_endpoint: self.endpoint(),
        };

        incoming
            .send(Arc::new(remote))
            .await
            .map_err(|_| dial_err("node is not accepting"))?;

        tracing::trace!(local = %self.peer_id, remote = %target, "memory connection established");
        Ok(Arc::new(local))
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.network.remove(&self.peer_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn pair() -> (Arc<MemoryNetwork>, MemoryTransport, MemoryTransport) {
        let network = MemoryNetwork::new();
        let a = network.create_transport(&Keypair::from_seed(&[1; 32])).await;
        let b = network.create_transport(&Keypair::from_seed(&[2; 32])).await;
        (network, a, b)
    }

    #[tokio::test]
    async fn test_dial_and_accept_authenticate_both_sides() {
        let (_network, a, b) = pair().await;

        let outbound = a.dial(&b.endpoint()).await.unwrap();
        let inbound = b.accept().await.unwrap();

        assert_eq!(outbound.remote_peer_id(), b.peer_id());
        assert_eq!(inbound.remote_peer_id(), a.peer_id());
        assert_eq!(inbound.remote_endpoint(), a.endpoint());
    }

    #[tokio::test]
    async fn test_streams_carry_messages_both_ways() {
        let (_network, a, b) = pair().await;
        let outbound = a.dial(&b.endpoint()).await.unwrap();
        let inbound = b.accept().await.unwrap();

        let mut left = outbound.stream(0x60).unwrap();
        let mut right = inbound.stream(0x60).unwrap();

        left.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Bytes::from_static(b"ping"));

        right.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(left.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_close_propagates_to_remote() {
        let (_network, a, b) = pair().await;
        let outbound = a.dial(&b.endpoint()).await.unwrap();
        let inbound = b.accept().await.unwrap();
        let mut stream = inbound.stream(1).unwrap();

        outbound.close().await.unwrap();
        inbound.closed().cancelled().await;
        assert!(inbound.is_closed());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dial_errors() {
        let (_network, a, b) = pair().await;

        let unknown = Endpoint::local(Protocol::memory(), PeerId::from_bytes([9; 20]).to_hex());
        assert!(matches!(a.dial(&unknown).await, Err(P2pError::Dial { .. })));

        let wrong = Endpoint::local(Protocol::mconn(), b.peer_id().to_hex());
        assert!(matches!(
            a.dial(&wrong).await,
            Err(P2pError::UnsupportedProtocol(_))
        ));

        assert!(matches!(
            a.dial(&a.endpoint()).await,
            Err(P2pError::SelfConnection)
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_stops_accepting() {
        let (network, a, b) = pair().await;
        b.close().await.unwrap();

        assert!(matches!(b.accept().await, Err(P2pError::TransportClosed)));
        assert!(a.dial(&b.endpoint()).await.is_err());
        assert_eq!(network.peer_ids().await, vec![a.peer_id()]);
    }
}
