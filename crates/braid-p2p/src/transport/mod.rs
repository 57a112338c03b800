//! Transport abstraction.
//!
//! A [`Transport`] accepts and dials [`Connection`]s over one medium. A
//! connection is authenticated: by the time `accept` or `dial` returns, the
//! remote's public key has been proven. Each connection carries numbered
//! [`Stream`]s.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryTransport`]: in-process, for tests and simulations
//! - [`mconn::MConnTransport`]: TCP with the legacy packet framing

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use braid_core::{Ed25519PublicKey, Endpoint, PeerId, Protocol};

use crate::error::Result;
use crate::mux::{Multiplexer, Stream, StreamId};

pub mod mconn;
pub mod memory;

/// A medium over which connections are made.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Protocols this transport can dial.
    fn protocols(&self) -> Vec<Protocol>;

    /// Endpoints this transport listens on.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Wait for the next inbound connection.
    ///
    /// Returns [`P2pError::TransportClosed`](crate::P2pError::TransportClosed)
    /// once the transport is closed.
    async fn accept(&self) -> Result<Arc<dyn Connection>>;

    /// Open an outbound connection.
    async fn dial(&self, endpoint: &Endpoint) -> Result<Arc<dyn Connection>>;

    /// Stop listening. Established connections are unaffected.
    async fn close(&self) -> Result<()>;
}

/// An authenticated connection to one remote node.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// The public key the remote proved ownership of during set-up.
    fn remote_public_key(&self) -> Ed25519PublicKey;

    /// The remote node's id, derived from its public key.
    fn remote_peer_id(&self) -> PeerId {
        self.remote_public_key().peer_id()
    }

    fn local_endpoint(&self) -> Endpoint;

    fn remote_endpoint(&self) -> Endpoint;

    /// Claim logical stream `id`.
    fn stream(&self, id: StreamId) -> Result<Stream>;

    /// Close the connection and all its streams.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Token cancelled when the connection closes, from either side.
    fn closed(&self) -> CancellationToken;
}

/// State shared by every multiplexed connection implementation.
pub(crate) struct MuxedConnection {
    pub(crate) mux: Multiplexer,
    pub(crate) remote_key: Ed25519PublicKey,
    pub(crate) local_endpoint: Endpoint,
    pub(crate) remote_endpoint: Endpoint,
}

impl fmt::Debug for MuxedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote_key.peer_id())
            .field("local_endpoint", &self.local_endpoint.to_string())
            .field("remote_endpoint", &self.remote_endpoint.to_string())
            .field("closed", &self.mux.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection for MuxedConnection {
    fn remote_public_key(&self) -> Ed25519PublicKey {
        self.remote_key
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint.clone()
    }

    fn remote_endpoint(&self) -> Endpoint {
        self.remote_endpoint.clone()
    }

    fn stream(&self, id: StreamId) -> Result<Stream> {
        self.mux.stream(id)
    }

    async fn close(&self) -> Result<()> {
        self.mux.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    fn closed(&self) -> CancellationToken {
        self.mux.closed_token()
    }
}
