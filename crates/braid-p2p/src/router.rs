//! The router: maps channel messages to and from peer connections.
//!
//! # Tasks
//!
//! - one dial loop, fed by [`PeerManager::wait_dial_next`]
//! - one accept loop per transport
//! - one peer-error loop handling [`PeerError`]s reported by reactors
//! - per connection: a lifecycle task, a send task draining the peer's
//!   [`Scheduler`](crate::Scheduler), and one receive task per stream
//! - per channel: a routing task draining the channel's outbound queue
//!
//! All of them stop when the router's [`CancellationToken`] fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use braid_core::{Endpoint, Keypair, PeerAddress, PeerId, Protocol};

use crate::channel::{
    encode_message, Channel, ChannelDescriptor, ChannelId, ChannelMessage, Envelope, InboundSink,
    PeerError, PeerErrorAction, TypedInbound,
};
use crate::error::{P2pError, Result};
use crate::mux::StreamReceiver;
use crate::mux::StreamSender;
use crate::peer_manager::{DialCandidate, PeerManager, PeerUpdates};
use crate::resolve::resolve;
use crate::scheduler::{PeerQueue, Scheduler};
use crate::transport::{Connection, Transport};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Deadline for dialing one endpoint, handshake included.
    pub dial_timeout: Duration,
    /// How long a DNS resolution stays fresh.
    pub resolve_interval: Duration,
    /// Dials in flight at once.
    pub max_concurrent_dials: usize,
    /// Buffer for reported peer errors.
    pub peer_error_buffer: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            resolve_interval: Duration::from_secs(300),
            max_concurrent_dials: 8,
            peer_error_buffer: 64,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ChannelEntry {
    descriptor: ChannelDescriptor,
    inbound: Arc<dyn InboundSink>,
}

struct PeerHandle {
    conn: Arc<dyn Connection>,
    queue: PeerQueue,
    streams: Mutex<HashMap<ChannelId, StreamSender>>,
    cancel: CancellationToken,
}

struct Inner {
    local_id: PeerId,
    options: RouterOptions,
    peer_manager: Arc<PeerManager>,
    transports: Vec<Arc<dyn Transport>>,
    by_protocol: HashMap<Protocol, Arc<dyn Transport>>,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    peers: Mutex<HashMap<PeerId, Arc<PeerHandle>>>,
    errors_tx: mpsc::Sender<PeerError>,
    errors_rx: Mutex<Option<mpsc::Receiver<PeerError>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Routes messages between open channels and connected peers.
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    /// Create a router. `peer_manager` must belong to `keypair`.
    pub fn new(
        keypair: &Keypair,
        transports: Vec<Arc<dyn Transport>>,
        peer_manager: Arc<PeerManager>,
        options: RouterOptions,
    ) -> Result<Self> {
        let local_id = keypair.peer_id();
        if peer_manager.self_id() != local_id {
            return Err(P2pError::PeerIdMismatch {
                expected: local_id,
                actual: peer_manager.self_id(),
            });
        }

        let mut by_protocol = HashMap::new();
        for transport in &transports {
            for protocol in transport.protocols() {
                by_protocol.insert(protocol, Arc::clone(transport));
            }
        }

        let (errors_tx, errors_rx) = mpsc::channel(options.peer_error_buffer.max(1));
        Ok(Self {
            inner: Arc::new(Inner {
                local_id,
                options,
                peer_manager,
                transports,
                by_protocol,
                channels: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                errors_tx,
                errors_rx: Mutex::new(Some(errors_rx)),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.inner.peer_manager
    }

    /// Every endpoint the router's transports listen on.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .transports
            .iter()
            .flat_map(|t| t.endpoints())
            .collect()
    }

    /// Peers with a live, routed connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = lock(&self.inner.peers).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Learn a peer address.
    pub async fn add_address(&self, address: PeerAddress) -> Result<bool> {
        self.inner.peer_manager.add_address(address).await
    }

    /// Subscribe to peer status changes.
    pub async fn subscribe_peer_updates(&self) -> PeerUpdates {
        self.inner.peer_manager.subscribe().await
    }

    /// Open a channel.
    ///
    /// Fails with [`P2pError::ChannelInUse`] while another channel with the
    /// same id is open. Channels may be opened before or after `start`.
    pub fn open_channel<M: ChannelMessage>(&self, descriptor: ChannelDescriptor) -> Result<Channel<M>> {
        let id = descriptor.id;
        let (in_tx, in_rx) = mpsc::channel(descriptor.recv_buffer_capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(descriptor.send_queue_capacity.max(1));
        let inbound: Arc<dyn InboundSink> = Arc::new(TypedInbound::<M> { tx: in_tx });

        {
            let mut channels = lock(&self.inner.channels);
            if channels.contains_key(&id) {
                return Err(P2pError::ChannelInUse(id));
            }
            channels.insert(
                id,
                ChannelEntry {
                    descriptor: descriptor.clone(),
                    inbound,
                },
            );

            let peers = lock(&self.inner.peers);
            for (peer_id, handle) in peers.iter() {
                handle.queue.add_channel(&descriptor);
                self.inner.open_stream(*peer_id, handle, id);
            }
        }

        tokio::spawn(Arc::clone(&self.inner).route_channel::<M>(id, out_rx));
        tracing::debug!(channel = %id, priority = descriptor.priority, "opened channel");
        Ok(Channel::new(id, in_rx, out_tx, self.inner.errors_tx.clone()))
    }

    /// Start dialing, accepting and handling peer errors. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let errors_rx = lock(&self.inner.errors_rx)
            .take()
            .ok_or(P2pError::ChannelClosed)?;

        let mut tasks = lock(&self.inner.tasks);
        tasks.push(tokio::spawn(Arc::clone(&self.inner).dial_peers()));
        for transport in &self.inner.transports {
            tasks.push(tokio::spawn(
                Arc::clone(&self.inner).accept_peers(Arc::clone(transport)),
            ));
        }
        tasks.push(tokio::spawn(
            Arc::clone(&self.inner).handle_peer_errors(errors_rx),
        ));

        tracing::info!(node = %self.inner.local_id, endpoints = ?self.endpoints(), "router started");
        Ok(())
    }

    /// Stop every task, close transports and connections.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        for transport in &self.inner.transports {
            if let Err(e) = transport.close().await {
                tracing::debug!(err = %e, "error closing transport");
            }
        }

        let handles: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.peer_manager.close_subscriptions().await;
        tracing::info!(node = %self.inner.local_id, "router stopped");
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn route_channel<M: ChannelMessage>(
        self: Arc<Self>,
        id: ChannelId,
        mut outbound: mpsc::Receiver<Envelope<M>>,
    ) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            if !envelope.is_addressed() {
                tracing::debug!(channel = %id, "dropping envelope without a single destination");
                continue;
            }

            let Envelope { to, message, .. } = envelope;
            let payload = match encode_message(message) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(channel = %id, err = %e, "failed to encode message");
                    continue;
                }
            };

            let targets: Vec<(PeerId, Arc<PeerHandle>)> = {
                let peers = lock(&self.peers);
                match to {
                    Some(peer_id) => peers
                        .get(&peer_id)
                        .map(|h| vec![(peer_id, Arc::clone(h))])
                        .unwrap_or_default(),
                    None => peers.iter().map(|(id, h)| (*id, Arc::clone(h))).collect(),
                }
            };
            if let (Some(peer_id), true) = (to, targets.is_empty()) {
                tracing::debug!(channel = %id, peer = %peer_id, "dropping message for unconnected peer");
            }

            for (peer_id, handle) in targets {
                if !handle.queue.enqueue(id, payload.clone()) {
                    tracing::debug!(channel = %id, peer = %peer_id, "peer queue full, dropping message");
                }
            }
        }
        self.close_channel(id);
    }

    fn close_channel(&self, id: ChannelId) {
        let _guard = lock(&self.channels).remove(&id);
        for handle in lock(&self.peers).values() {
            handle.queue.remove_channel(id);
        }
        tracing::debug!(channel = %id, "closed channel");
    }

    /// Claim the stream for `id` on `handle`'s connection, if not yet done.
    fn open_stream(self: &Arc<Self>, peer_id: PeerId, handle: &Arc<PeerHandle>, id: ChannelId) {
        let mut streams = lock(&handle.streams);
        if streams.contains_key(&id) {
            return;
        }
        match handle.conn.stream(id.0) {
            Ok(stream) => {
                let (tx, rx) = stream.split();
                streams.insert(id, tx);
                tokio::spawn(Arc::clone(self).receive_stream(
                    peer_id,
                    id,
                    rx,
                    handle.cancel.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(peer = %peer_id, channel = %id, err = %e, "failed to open stream");
            }
        }
    }

    async fn receive_stream(
        self: Arc<Self>,
        peer_id: PeerId,
        id: ChannelId,
        mut stream: StreamReceiver,
        cancel: CancellationToken,
    ) {
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                payload = stream.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let entry = lock(&self.channels)
                .get(&id)
                .map(|e| (Arc::clone(&e.inbound), e.descriptor.recv_message_capacity));
            let Some((inbound, max_size)) = entry else {
                tracing::debug!(peer = %peer_id, channel = %id, "dropping message for closed channel");
                continue;
            };

            if payload.len() > max_size {
                tracing::error!(
                    peer = %peer_id,
                    channel = %id,
                    size = payload.len(),
                    max = max_size,
                    "message exceeds channel capacity, disconnecting"
                );
                cancel.cancel();
                break;
            }

            let delivered = tokio::select! {
                _ = cancel.cancelled() => break,
                res = inbound.deliver(peer_id, payload) => res,
            };
            match delivered {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(peer = %peer_id, channel = %id, "channel closed, dropping message");
                }
                Err(e) => {
                    tracing::error!(peer = %peer_id, channel = %id, err = %e, "invalid message, disconnecting");
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    async fn send_peer(handle: Arc<PeerHandle>) {
        while let Some((id, payload)) = handle.queue.dequeue(&handle.cancel).await {
            let writer = lock(&handle.streams).get(&id).cloned();
            let Some(writer) = writer else {
                tracing::debug!(channel = %id, "no stream for channel, dropping message");
                continue;
            };
            if let Err(e) = writer.send(payload).await {
                tracing::debug!(channel = %id, err = %e, "send failed");
                handle.cancel.cancel();
                break;
            }
        }
    }

    /// Run a connection until it closes or is evicted.
    async fn route_peer(self: Arc<Self>, peer_id: PeerId, conn: Arc<dyn Connection>) {
        let handle = Arc::new(PeerHandle {
            conn: Arc::clone(&conn),
            queue: PeerQueue::new(Scheduler::new(std::iter::empty())),
            streams: Mutex::new(HashMap::new()),
            cancel: self.cancel.child_token(),
        });

        {
            let channels = lock(&self.channels);
            let mut peers = lock(&self.peers);
            peers.insert(peer_id, Arc::clone(&handle));
            for entry in channels.values() {
                handle.queue.add_channel(&entry.descriptor);
                self.open_stream(peer_id, &handle, entry.descriptor.id);
            }
        }

        let send_task = tokio::spawn(Self::send_peer(Arc::clone(&handle)));
        match self.peer_manager.ready(&peer_id).await {
            Ok(()) => {
                tracing::info!(peer = %peer_id, endpoint = %conn.remote_endpoint(), "peer connected");
            }
            Err(e) => {
                tracing::warn!(peer = %peer_id, err = %e, "failed to mark peer ready");
                handle.cancel.cancel();
            }
        }

        let closed = conn.closed();
        tokio::select! {
            _ = handle.cancel.cancelled() => {}
            _ = closed.cancelled() => {}
        }
        handle.cancel.cancel();
        let _ = conn.close().await;

        {
            let mut peers = lock(&self.peers);
            if peers
                .get(&peer_id)
                .map_or(false, |h| Arc::ptr_eq(h, &handle))
            {
                peers.remove(&peer_id);
            }
        }
        let _ = send_task.await;

        if let Err(e) = self.peer_manager.disconnected(&peer_id).await {
            tracing::warn!(peer = %peer_id, err = %e, "failed to record disconnect");
        }
        tracing::info!(peer = %peer_id, "peer disconnected");
    }

    async fn dial_peers(self: Arc<Self>) {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_dials.max(1)));
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => return,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let candidate = tokio::select! {
                _ = self.cancel.cancelled() => return,
                candidate = self.peer_manager.wait_dial_next() => candidate,
            };

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                inner.dial_peer(candidate).await;
                drop(permit);
            });
        }
    }

    async fn dial_peer(self: &Arc<Self>, candidate: DialCandidate) {
        let peer_id = candidate.peer_id;
        for address in &candidate.addresses {
            let endpoints = match self.resolve_cached(address).await {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    tracing::debug!(peer = %peer_id, err = %e, "failed to resolve address");
                    continue;
                }
            };

            for endpoint in endpoints {
                let Some(transport) = self.by_protocol.get(&endpoint.protocol) else {
                    tracing::trace!(%endpoint, "no transport for endpoint");
                    continue;
                };
                let dialed =
                    tokio::time::timeout(self.options.dial_timeout, transport.dial(&endpoint)).await;
                let conn = match dialed {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        tracing::debug!(peer = %peer_id, %endpoint, err = %e, "dial failed");
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(peer = %peer_id, %endpoint, "dial timed out");
                        continue;
                    }
                };

                let remote = conn.remote_peer_id();
                if remote != peer_id {
                    tracing::warn!(expected = %peer_id, actual = %remote, %endpoint, "dialed unexpected peer");
                    let _ = conn.close().await;
                    continue;
                }

                match self.peer_manager.dialed(&peer_id).await {
                    Ok(()) => {
                        tokio::spawn(Arc::clone(self).route_peer(peer_id, conn));
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer_id, err = %e, "dropping dialed connection");
                        let _ = conn.close().await;
                    }
                }
                return;
            }
        }
        self.peer_manager.dial_failed(&peer_id).await;
    }

    async fn resolve_cached(&self, address: &PeerAddress) -> Result<Vec<Endpoint>> {
        if let Some(endpoints) = self
            .peer_manager
            .cached_endpoints(address, self.options.resolve_interval)
            .await
        {
            return Ok(endpoints);
        }
        let endpoints = resolve(address).await?;
        self.peer_manager
            .store_resolution(address, endpoints.clone())
            .await;
        Ok(endpoints)
    }

    async fn accept_peers(self: Arc<Self>, transport: Arc<dyn Transport>) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = transport.accept() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(P2pError::TransportClosed) => return,
                Err(e) => {
                    tracing::debug!(err = %e, "failed to accept connection");
                    continue;
                }
            };

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                let peer_id = conn.remote_peer_id();
                match inner.peer_manager.accepted(&peer_id).await {
                    Ok(()) => inner.route_peer(peer_id, conn).await,
                    Err(e) => {
                        tracing::debug!(peer = %peer_id, err = %e, "rejected inbound connection");
                        let _ = conn.close().await;
                    }
                }
            });
        }
    }

    async fn handle_peer_errors(self: Arc<Self>, mut errors: mpsc::Receiver<PeerError>) {
        loop {
            let error = tokio::select! {
                _ = self.cancel.cancelled() => return,
                error = errors.recv() => match error {
                    Some(error) => error,
                    None => return,
                },
            };
            let peer_id = error.peer_id;
            match error.action {
                PeerErrorAction::None => {
                    tracing::warn!(peer = %peer_id, err = %error.error, "peer error");
                }
                PeerErrorAction::Disconnect => {
                    tracing::warn!(peer = %peer_id, err = %error.error, "disconnecting peer");
                    self.evict(&peer_id);
                }
                PeerErrorAction::Ban => {
                    tracing::warn!(peer = %peer_id, err = %error.error, "banning peer");
                    if let Err(e) = self.peer_manager.ban(&peer_id, &error.error).await {
                        tracing::error!(peer = %peer_id, err = %e, "failed to ban peer");
                    }
                    self.evict(&peer_id);
                }
            }
        }
    }

    fn evict(&self, peer_id: &PeerId) {
        if let Some(handle) = lock(&self.peers).get(peer_id) {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use crate::PeerUpdate;
    use braid_core::PeerStatus;
    use braid_store::MemoryPeerStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    crate::plain_channel_message!(Note);

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn note(text: &str) -> Note {
        Note { text: text.into() }
    }

    fn descriptor(id: u16) -> ChannelDescriptor {
        ChannelDescriptor::new(id).with_priority(1)
    }

    struct TestNode {
        router: Router,
        id: PeerId,
        address: PeerAddress,
    }

    async fn node(network: &Arc<MemoryNetwork>, seed: u8) -> TestNode {
        let keypair = Keypair::from_seed(&[seed; 32]);
        let transport = network.create_transport(&keypair).await;
        let address = PeerAddress::from_endpoint(keypair.peer_id(), &transport.endpoint());
        let peer_manager = PeerManager::load(
            keypair.peer_id(),
            Arc::new(MemoryPeerStore::new()),
            Default::default(),
        )
        .await
        .unwrap();
        let router = Router::new(
            &keypair,
            vec![Arc::new(transport)],
            Arc::new(peer_manager),
            RouterOptions::default(),
        )
        .unwrap();
        TestNode {
            router,
            id: keypair.peer_id(),
            address,
        }
    }

    async fn wait_for(updates: &mut PeerUpdates, peer_id: PeerId, status: PeerStatus) {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                match updates.recv().await {
                    Some(PeerUpdate { peer_id: p, status: s }) if p == peer_id && s == status => {
                        return
                    }
                    Some(_) => continue,
                    None => panic!("peer updates closed"),
                }
            }
        })
        .await
        .unwrap();
    }

    /// Start `a` and `b`, make `a` dial `b`, and wait until both see each
    /// other `Up`.
    async fn connect(a: &TestNode, b: &TestNode) {
        let mut a_updates = a.router.subscribe_peer_updates().await;
        let mut b_updates = b.router.subscribe_peer_updates().await;
        a.router.start().unwrap();
        b.router.start().unwrap();
        a.router.add_address(b.address.clone()).await.unwrap();
        wait_for(&mut a_updates, b.id, PeerStatus::Up).await;
        wait_for(&mut b_updates, a.id, PeerStatus::Up).await;
    }

    async fn recv(channel: &mut Channel<Note>) -> Envelope<Note> {
        tokio::time::timeout(TIMEOUT, channel.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_message_delivered_with_sender() {
        init_tracing();
        let network = MemoryNetwork::new();
        let a = node(&network, 1).await;
        let b = node(&network, 2).await;
        let a_channel = a.router.open_channel::<Note>(descriptor(1)).unwrap();
        let mut b_channel = b.router.open_channel::<Note>(descriptor(1)).unwrap();
        connect(&a, &b).await;

        a_channel.sender().unwrap().to(b.id, note("hello")).await.unwrap();
        let envelope = recv(&mut b_channel).await;
        assert_eq!(envelope.from, Some(a.id));
        assert_eq!(envelope.message, note("hello"));

        a.router.stop().await;
        b.router.stop().await;
    }

    #[tokio::test]
    async fn test_misaddressed_envelope_is_never_delivered() {
        init_tracing();
        let network = MemoryNetwork::new();
        let a = node(&network, 1).await;
        let b = node(&network, 2).await;
        let a_channel = a.router.open_channel::<Note>(descriptor(1)).unwrap();
        let mut b_channel = b.router.open_channel::<Note>(descriptor(1)).unwrap();
        connect(&a, &b).await;

        let sender = a_channel.sender().unwrap();
        sender
            .send(Envelope {
                from: None,
                to: None,
                broadcast: false,
                message: note("lost"),
            })
            .await
            .unwrap();
        sender
            .send(Envelope {
                from: None,
                to: Some(b.id),
                broadcast: true,
                message: note("ambiguous"),
            })
            .await
            .unwrap();
        sender.to(b.id, note("kept")).await.unwrap();

        assert_eq!(recv(&mut b_channel).await.message, note("kept"));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), b_channel.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        init_tracing();
        let network = MemoryNetwork::new();
        let hub = node(&network, 1).await;
        let left = node(&network, 2).await;
        let right = node(&network, 3).await;

        let hub_channel = hub.router.open_channel::<Note>(descriptor(1)).unwrap();
        let mut left_channel = left.router.open_channel::<Note>(descriptor(1)).unwrap();
        let mut right_channel = right.router.open_channel::<Note>(descriptor(1)).unwrap();
        connect(&hub, &left).await;

        let mut hub_updates = hub.router.subscribe_peer_updates().await;
        right.router.start().unwrap();
        hub.router.add_address(right.address.clone()).await.unwrap();
        wait_for(&mut hub_updates, right.id, PeerStatus::Up).await;

        hub_channel.sender().unwrap().broadcast(note("all")).await.unwrap();
        assert_eq!(recv(&mut left_channel).await.from, Some(hub.id));
        assert_eq!(recv(&mut right_channel).await.from, Some(hub.id));
        assert_eq!(hub.router.connected_peers().len(), 2);
    }

    #[tokio::test]
    async fn test_channel_opened_after_connect() {
        init_tracing();
        let network = MemoryNetwork::new();
        let a = node(&network, 1).await;
        let b = node(&network, 2).await;
        connect(&a, &b).await;

        let a_channel = a.router.open_channel::<Note>(descriptor(7)).unwrap();
        let mut b_channel = b.router.open_channel::<Note>(descriptor(7)).unwrap();
        a_channel.sender().unwrap().to(b.id, note("late")).await.unwrap();
        assert_eq!(recv(&mut b_channel).await.message, note("late"));
    }

    #[tokio::test]
    async fn test_channel_id_reusable_after_close() {
        let network = MemoryNetwork::new();
        let a = node(&network, 1).await;

        let mut channel = a.router.open_channel::<Note>(descriptor(3)).unwrap();
        assert!(matches!(
            a.router.open_channel::<Note>(descriptor(3)),
            Err(P2pError::ChannelInUse(ChannelId(3)))
        ));

        channel.close();
        assert!(tokio::time::timeout(TIMEOUT, channel.recv())
            .await
            .unwrap()
            .is_none());

        tokio::time::timeout(TIMEOUT, async {
            loop {
                match a.router.open_channel::<Note>(descriptor(3)) {
                    Ok(_) => break,
                    Err(P2pError::ChannelInUse(_)) => {
                        tokio::time::sleep(Duration::from_millis(5)).await
                    }
                    Err(e) => panic!("unexpected error {}", e),
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_ban_evicts_and_blocks_peer() {
        init_tracing();
        let network = MemoryNetwork::new();
        let a = node(&network, 1).await;
        let b = node(&network, 2).await;
        let _a_channel = a.router.open_channel::<Note>(descriptor(1)).unwrap();
        let b_channel = b.router.open_channel::<Note>(descriptor(1)).unwrap();
        connect(&a, &b).await;

        let mut a_updates = a.router.subscribe_peer_updates().await;
        b_channel
            .sender()
            .unwrap()
            .report_error(PeerError::ban(a.id, "sent garbage"))
            .await
            .unwrap();

        wait_for(&mut a_updates, b.id, PeerStatus::Down).await;
        assert_eq!(
            b.router.peer_manager().status(&a.id).await,
            Some(PeerStatus::Banned)
        );
        assert!(!b.router.connected_peers().contains(&a.id));
    }

    #[tokio::test]
    async fn test_undecodable_message_disconnects() {
        init_tracing();
        let network = MemoryNetwork::new();
        let a = node(&network, 1).await;
        let b = node(&network, 2).await;

        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Other(u64);
        crate::plain_channel_message!(Other);

        let a_channel = a.router.open_channel::<Other>(descriptor(1)).unwrap();
        let _b_channel = b.router.open_channel::<Note>(descriptor(1)).unwrap();
        connect(&a, &b).await;

        let mut a_updates = a.router.subscribe_peer_updates().await;
        a_channel.sender().unwrap().to(b.id, Other(42)).await.unwrap();
        wait_for(&mut a_updates, b.id, PeerStatus::Down).await;
    }

    #[tokio::test]
    async fn test_router_rejects_foreign_peer_manager() {
        let peer_manager = PeerManager::load(
            PeerId::from_bytes([9; 20]),
            Arc::new(MemoryPeerStore::new()),
            Default::default(),
        )
        .await
        .unwrap();
        let result = Router::new(
            &Keypair::from_seed(&[1; 32]),
            Vec::new(),
            Arc::new(peer_manager),
            RouterOptions::default(),
        );
        assert!(matches!(result, Err(P2pError::PeerIdMismatch { .. })));
    }
}
