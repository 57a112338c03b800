//! Peer directory.
//!
//! The [`PeerManager`] tracks every peer the node knows about: its
//! addresses, lifecycle status, dial backoff and whether it currently has a
//! connection. The router asks it which peer to dial next and reports every
//! connection event back. Status changes are persisted through a
//! [`PeerStore`] and broadcast to [`PeerUpdates`] subscribers.
//!
//! The internal peer record never leaves this module; callers see
//! [`PeerInfo`] snapshots and [`PeerUpdate`] events.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify};

use braid_core::{Endpoint, PeerAddress, PeerId, PeerStatus};
use braid_store::{PeerRecord, PeerStore};

use crate::error::{P2pError, Result};

/// Configuration for the peer directory.
#[derive(Debug, Clone)]
pub struct PeerManagerOptions {
    /// Maximum concurrent connections, inbound plus outbound.
    pub max_connected: usize,
    /// Base dial retry delay.
    pub min_retry_time: Duration,
    /// Cap on the dial retry delay.
    pub max_retry_time: Duration,
    /// Upper bound of the random delay added to each retry.
    pub retry_jitter: Duration,
    /// Peers that are always redialed.
    pub persistent_peers: Vec<PeerId>,
    /// Buffer of each [`PeerUpdates`] subscription.
    pub update_buffer: usize,
}

impl Default for PeerManagerOptions {
    fn default() -> Self {
        Self {
            max_connected: 64,
            min_retry_time: Duration::from_millis(250),
            max_retry_time: Duration::from_secs(60),
            retry_jitter: Duration::from_millis(250),
            persistent_peers: Vec::new(),
            update_buffer: 64,
        }
    }
}

/// A peer status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUpdate {
    pub peer_id: PeerId,
    pub status: PeerStatus,
}

/// Subscription to [`PeerUpdate`]s.
///
/// Updates are delivered in order. The subscriber must keep draining:
/// delivery blocks when the buffer is full.
pub struct PeerUpdates {
    rx: mpsc::Receiver<PeerUpdate>,
}

impl PeerUpdates {
    pub(crate) fn new(rx: mpsc::Receiver<PeerUpdate>) -> Self {
        Self { rx }
    }

    /// Next update, or `None` once the router has shut down.
    pub async fn recv(&mut self) -> Option<PeerUpdate> {
        self.rx.recv().await
    }
}

/// Immutable snapshot of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub status: PeerStatus,
    pub addresses: Vec<PeerAddress>,
    pub persistent: bool,
    pub priority: u8,
    pub connected: bool,
    pub dial_failures: u32,
    pub last_connected: Option<i64>,
}

/// What the router needs to dial a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialCandidate {
    pub peer_id: PeerId,
    pub addresses: Vec<PeerAddress>,
}

struct Resolution {
    endpoints: Vec<Endpoint>,
    at: Instant,
}

struct Peer {
    id: PeerId,
    status: PeerStatus,
    priority: u8,
    persistent: bool,
    addresses: Vec<PeerAddress>,
    resolved: HashMap<PeerAddress, Resolution>,
    dial_failures: u32,
    next_dial_at: Option<Instant>,
    last_connected: Option<i64>,
    dialing: bool,
    connected: bool,
}

impl Peer {
    fn new(id: PeerId) -> Self {
        Self::from_record(PeerRecord::new(id))
    }

    fn from_record(record: PeerRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            priority: record.priority,
            persistent: record.persistent,
            addresses: record.addresses,
            resolved: HashMap::new(),
            dial_failures: 0,
            next_dial_at: None,
            last_connected: record.last_connected,
            dialing: false,
            connected: false,
        }
    }

    fn record(&self) -> PeerRecord {
        PeerRecord {
            id: self.id,
            addresses: self.addresses.clone(),
            status: self.status,
            priority: self.priority,
            persistent: self.persistent,
            last_connected: self.last_connected,
        }
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            status: self.status,
            addresses: self.addresses.clone(),
            persistent: self.persistent,
            priority: self.priority,
            connected: self.connected,
            dial_failures: self.dial_failures,
            last_connected: self.last_connected,
        }
    }

    fn is_dialable(&self, now: Instant) -> bool {
        self.status.is_connectable()
            && !self.connected
            && !self.dialing
            && !self.addresses.is_empty()
            && self.next_dial_at.map_or(true, |at| at <= now)
    }

    fn transition(&mut self, to: PeerStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(P2pError::InvalidTransition {
                peer: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Default)]
struct State {
    peers: HashMap<PeerId, Peer>,
    subscribers: Vec<mpsc::Sender<PeerUpdate>>,
}

impl State {
    fn occupied(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.connected || p.dialing)
            .count()
    }
}

/// The peer directory.
pub struct PeerManager {
    self_id: PeerId,
    options: PeerManagerOptions,
    store: Arc<dyn PeerStore>,
    state: Mutex<State>,
    /// Held across a status change and its delivery, so subscribers see
    /// changes in the order they were applied.
    updates: Mutex<()>,
    dial_wake: Notify,
}

/// A status change to deliver once the directory lock is released.
struct Broadcast {
    update: PeerUpdate,
    subscribers: Vec<mpsc::Sender<PeerUpdate>>,
}

impl Broadcast {
    async fn deliver(self) {
        for tx in self.subscribers {
            // Closed subscriptions are pruned on the next status change.
            let _ = tx.send(self.update).await;
        }
    }
}

impl PeerManager {
    /// Create a directory and load persisted peers from `store`.
    ///
    /// Peers persisted as `Up` are restored as `Down`, since no connection
    /// survives a restart.
    pub async fn load(
        self_id: PeerId,
        store: Arc<dyn PeerStore>,
        options: PeerManagerOptions,
    ) -> Result<Self> {
        let mut peers = HashMap::new();
        for record in store.load_peers().await? {
            if record.id == self_id {
                continue;
            }
            let mut peer = Peer::from_record(record);
            if peer.status == PeerStatus::Up {
                peer.status = PeerStatus::Down;
            }
            if options.persistent_peers.contains(&peer.id) {
                peer.persistent = true;
            }
            peers.insert(peer.id, peer);
        }
        tracing::debug!(peers = peers.len(), "loaded peer directory");

        Ok(Self {
            self_id,
            options,
            store,
            state: Mutex::new(State {
                peers,
                subscribers: Vec::new(),
            }),
            updates: Mutex::new(()),
            dial_wake: Notify::new(),
        })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn max_connected(&self) -> usize {
        self.options.max_connected
    }

    /// Learn an address. Returns whether anything changed.
    ///
    /// Addresses of ourselves and of banned peers are ignored.
    pub async fn add_address(&self, address: PeerAddress) -> Result<bool> {
        let persistent = self.options.persistent_peers.contains(&address.peer_id);
        self.insert_address(address, persistent).await
    }

    /// Learn an address of a peer that must always be redialed.
    pub async fn add_persistent(&self, address: PeerAddress) -> Result<bool> {
        self.insert_address(address, true).await
    }

    async fn insert_address(&self, address: PeerAddress, persistent: bool) -> Result<bool> {
        if address.peer_id == self.self_id {
            return Ok(false);
        }
        let mut state = self.state.lock().await;
        let peer = state
            .peers
            .entry(address.peer_id)
            .or_insert_with(|| Peer::new(address.peer_id));
        if peer.status == PeerStatus::Banned {
            return Ok(false);
        }

        let mut changed = false;
        if persistent && !peer.persistent {
            peer.persistent = true;
            changed = true;
        }
        if !peer.addresses.contains(&address) {
            peer.addresses.push(address);
            changed = true;
        }
        if changed {
            let record = peer.record();
            self.store.upsert_peer(&record).await?;
            self.dial_wake.notify_one();
        }
        Ok(changed)
    }

    /// Pick the best peer to dial now and mark it as being dialed.
    ///
    /// Persistent peers come first, then higher priority, then fewer
    /// failed dials.
    pub async fn dial_next(&self) -> Option<DialCandidate> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.occupied() >= self.options.max_connected {
            return None;
        }
        let peer = state
            .peers
            .values_mut()
            .filter(|p| p.is_dialable(now))
            .max_by_key(|p| {
                (
                    p.persistent,
                    p.priority,
                    Reverse(p.dial_failures),
                    Reverse(p.id),
                )
            })?;
        peer.dialing = true;
        Some(DialCandidate {
            peer_id: peer.id,
            addresses: peer.addresses.clone(),
        })
    }

    /// Wait until a peer can be dialed.
    pub async fn wait_dial_next(&self) -> DialCandidate {
        loop {
            if let Some(candidate) = self.dial_next().await {
                return candidate;
            }
            let wake_at = {
                let state = self.state.lock().await;
                state
                    .peers
                    .values()
                    .filter(|p| p.status.is_connectable() && !p.connected && !p.dialing)
                    .filter_map(|p| p.next_dial_at)
                    .min()
            };
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.dial_wake.notified() => {}
                        _ = tokio::time::sleep_until(at.into()) => {}
                    }
                }
                None => self.dial_wake.notified().await,
            }
        }
    }

    /// Record a failed dial and schedule the retry.
    pub async fn dial_failed(&self, peer_id: &PeerId) {
        let mut state = self.state.lock().await;
        if let Some(peer) = state.peers.get_mut(peer_id) {
            peer.dialing = false;
            peer.dial_failures = peer.dial_failures.saturating_add(1);
            let delay = self.retry_delay(peer.dial_failures);
            peer.next_dial_at = Some(Instant::now() + delay);
            tracing::debug!(peer = %peer_id, failures = peer.dial_failures, ?delay, "dial failed");
        }
        self.dial_wake.notify_one();
    }

    /// Backoff before dial attempt number `failures + 1`.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let base = self
            .options
            .min_retry_time
            .saturating_mul(1u32 << failures.min(16))
            .min(self.options.max_retry_time);
        let jitter_ms = self.options.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// An outbound connection to `peer_id` was established.
    pub async fn dialed(&self, peer_id: &PeerId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(peer) = state.peers.get_mut(peer_id) {
            peer.dialing = false;
        }
        let occupied = state.occupied();
        let peer = state
            .peers
            .get_mut(peer_id)
            .ok_or(P2pError::UnknownPeer(*peer_id))?;
        self.admit(peer, occupied)?;
        peer.dial_failures = 0;
        peer.next_dial_at = None;
        Ok(())
    }

    /// An inbound connection from `peer_id` was established.
    pub async fn accepted(&self, peer_id: &PeerId) -> Result<()> {
        if *peer_id == self.self_id {
            return Err(P2pError::SelfConnection);
        }
        let mut state = self.state.lock().await;
        let occupied = state.occupied();
        let peer = state
            .peers
            .entry(*peer_id)
            .or_insert_with(|| Peer::new(*peer_id));
        self.admit(peer, occupied)
    }

    fn admit(&self, peer: &mut Peer, occupied: usize) -> Result<()> {
        if peer.status == PeerStatus::Banned {
            return Err(P2pError::PeerBanned(peer.id));
        }
        if peer.connected {
            return Err(P2pError::AlreadyConnected(peer.id));
        }
        if occupied >= self.options.max_connected {
            return Err(P2pError::MaxConnections);
        }
        peer.connected = true;
        Ok(())
    }

    /// The router is routing for `peer_id`; marks it `Up`.
    pub async fn ready(&self, peer_id: &PeerId) -> Result<()> {
        let _order = self.updates.lock().await;
        let mut state = self.state.lock().await;
        let peer = state
            .peers
            .get_mut(peer_id)
            .ok_or(P2pError::UnknownPeer(*peer_id))?;
        if !peer.connected {
            return Err(P2pError::ConnectionClosed);
        }
        peer.transition(PeerStatus::Up)?;
        peer.last_connected = Some(now_millis());
        let record = peer.record();
        self.store.upsert_peer(&record).await?;
        let broadcast = Self::broadcast(&mut state, *peer_id, PeerStatus::Up);
        drop(state);
        broadcast.deliver().await;
        Ok(())
    }

    /// The connection to `peer_id` ended.
    pub async fn disconnected(&self, peer_id: &PeerId) -> Result<()> {
        let _order = self.updates.lock().await;
        let mut state = self.state.lock().await;
        let Some(peer) = state.peers.get_mut(peer_id) else {
            return Ok(());
        };
        peer.connected = false;
        peer.next_dial_at = Some(Instant::now() + self.options.min_retry_time);
        if peer.status != PeerStatus::Up {
            return Ok(());
        }
        peer.transition(PeerStatus::Down)?;
        let record = peer.record();
        self.store.upsert_peer(&record).await?;
        let broadcast = Self::broadcast(&mut state, *peer_id, PeerStatus::Down);
        drop(state);
        self.dial_wake.notify_one();
        broadcast.deliver().await;
        Ok(())
    }

    /// Ban a peer. Idempotent.
    pub async fn ban(&self, peer_id: &PeerId, reason: &str) -> Result<()> {
        if *peer_id == self.self_id {
            return Err(P2pError::SelfConnection);
        }
        let _order = self.updates.lock().await;
        let mut state = self.state.lock().await;
        let peer = state
            .peers
            .entry(*peer_id)
            .or_insert_with(|| Peer::new(*peer_id));
        if peer.status == PeerStatus::Banned {
            return Ok(());
        }
        peer.transition(PeerStatus::Banned)?;
        tracing::warn!(peer = %peer_id, reason, "banned peer");
        let record = peer.record();
        self.store.upsert_peer(&record).await?;
        let broadcast = Self::broadcast(&mut state, *peer_id, PeerStatus::Banned);
        drop(state);
        broadcast.deliver().await;
        Ok(())
    }

    /// Drop a peer from the directory and the store.
    pub async fn remove(&self, peer_id: &PeerId) -> Result<()> {
        let _order = self.updates.lock().await;
        let mut state = self.state.lock().await;
        let peer = state
            .peers
            .get_mut(peer_id)
            .ok_or(P2pError::UnknownPeer(*peer_id))?;
        peer.transition(PeerStatus::Removed)?;
        state.peers.remove(peer_id);
        self.store.remove_peer(peer_id).await?;
        let broadcast = Self::broadcast(&mut state, *peer_id, PeerStatus::Removed);
        drop(state);
        broadcast.deliver().await;
        Ok(())
    }

    pub async fn status(&self, peer_id: &PeerId) -> Option<PeerStatus> {
        self.state.lock().await.peers.get(peer_id).map(|p| p.status)
    }

    /// Snapshots of every known peer, ordered by id.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let state = self.state.lock().await;
        let mut infos: Vec<_> = state.peers.values().map(Peer::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Peers that currently have a connection.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.state.lock().await;
        let mut ids: Vec<_> = state
            .peers
            .values()
            .filter(|p| p.connected)
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    /// Subscribe to status changes.
    pub async fn subscribe(&self) -> PeerUpdates {
        let (tx, rx) = mpsc::channel(self.options.update_buffer.max(1));
        self.state.lock().await.subscribers.push(tx);
        PeerUpdates::new(rx)
    }

    /// End every subscription.
    pub(crate) async fn close_subscriptions(&self) {
        self.state.lock().await.subscribers.clear();
    }

    /// Cached endpoints for `address`, if resolved within `max_age`.
    pub async fn cached_endpoints(
        &self,
        address: &PeerAddress,
        max_age: Duration,
    ) -> Option<Vec<Endpoint>> {
        let state = self.state.lock().await;
        let resolution = state.peers.get(&address.peer_id)?.resolved.get(address)?;
        (resolution.at.elapsed() <= max_age).then(|| resolution.endpoints.clone())
    }

    /// Remember the endpoints `address` resolved to.
    pub async fn store_resolution(&self, address: &PeerAddress, endpoints: Vec<Endpoint>) {
        let mut state = self.state.lock().await;
        if let Some(peer) = state.peers.get_mut(&address.peer_id) {
            peer.resolved.insert(
                address.clone(),
                Resolution {
                    endpoints,
                    at: Instant::now(),
                },
            );
        }
    }

    fn broadcast(state: &mut State, peer_id: PeerId, status: PeerStatus) -> Broadcast {
        state.subscribers.retain(|tx| !tx.is_closed());
        Broadcast {
            update: PeerUpdate { peer_id, status },
            subscribers: state.subscribers.clone(),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
