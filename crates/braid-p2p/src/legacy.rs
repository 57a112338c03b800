//! Adapter for callback-style switches.
//!
//! Older peer stacks drive reactors through callbacks (`add_peer`,
//! `remove_peer`, `receive`) and expect them to call back into a switch
//! (`send`, `broadcast`, `stop_peer_for_error`). [`LegacyBridge`] sits
//! between such a switch and a reactor written against [`Channel`]s and
//! [`PeerUpdates`], so reactor logic exists once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use braid_core::{PeerId, PeerStatus};

use crate::channel::{
    encode_message, Channel, ChannelDescriptor, ChannelId, ChannelMessage, Envelope, InboundSink,
    PeerError, PeerErrorAction, TypedInbound,
};
use crate::error::{P2pError, Result};
use crate::peer_manager::{PeerUpdate, PeerUpdates};

/// Callbacks a legacy switch invokes on a reactor.
#[async_trait]
pub trait LegacyReactor: Send + Sync {
    /// A peer connected.
    async fn add_peer(&self, peer_id: PeerId);

    /// A peer disconnected.
    async fn remove_peer(&self, peer_id: PeerId, reason: &str);

    /// Raw bytes arrived from `peer_id` on `channel`.
    async fn receive(&self, channel: ChannelId, peer_id: PeerId, payload: Bytes);
}

/// Operations a legacy switch offers to reactors.
#[async_trait]
pub trait LegacySwitch: Send + Sync {
    /// Queue `payload` for one peer. Returns whether it was queued.
    async fn send(&self, channel: ChannelId, peer_id: PeerId, payload: Bytes) -> bool;

    /// Queue `payload` for every peer.
    async fn broadcast(&self, channel: ChannelId, payload: Bytes);

    /// Disconnect a misbehaving peer.
    async fn stop_peer_for_error(&self, peer_id: PeerId, reason: String);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bridges a [`LegacySwitch`] to channel-based reactors.
pub struct LegacyBridge {
    switch: Arc<dyn LegacySwitch>,
    channels: Mutex<HashMap<ChannelId, Arc<dyn InboundSink>>>,
    updates: mpsc::Sender<PeerUpdate>,
    errors: mpsc::Sender<PeerError>,
    cancel: CancellationToken,
}

impl LegacyBridge {
    /// Create a bridge. The returned [`PeerUpdates`] yields one update per
    /// `add_peer`/`remove_peer` callback.
    pub fn new(switch: Arc<dyn LegacySwitch>, buffer: usize) -> (Arc<Self>, PeerUpdates) {
        let (updates_tx, updates_rx) = mpsc::channel(buffer.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(buffer.max(1));
        let bridge = Arc::new(Self {
            switch,
            channels: Mutex::new(HashMap::new()),
            updates: updates_tx,
            errors: errors_tx,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&bridge).pump_errors(errors_rx));
        (bridge, PeerUpdates::new(updates_rx))
    }

    /// Open a channel whose traffic goes through the switch.
    pub fn open_channel<M: ChannelMessage>(
        self: &Arc<Self>,
        descriptor: ChannelDescriptor,
    ) -> Result<Channel<M>> {
        let id = descriptor.id;
        let (in_tx, in_rx) = mpsc::channel(descriptor.recv_buffer_capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(descriptor.send_queue_capacity.max(1));
        {
            let mut channels = lock(&self.channels);
            if channels.contains_key(&id) {
                return Err(P2pError::ChannelInUse(id));
            }
            channels.insert(id, Arc::new(TypedInbound::<M> { tx: in_tx }));
        }
        tokio::spawn(Arc::clone(self).pump_outbound::<M>(id, out_rx));
        Ok(Channel::new(id, in_rx, out_tx, self.errors.clone()))
    }

    /// Stop pumping.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn pump_outbound<M: ChannelMessage>(
        self: Arc<Self>,
        id: ChannelId,
        mut outbound: mpsc::Receiver<Envelope<M>>,
    ) {
        loop {
            let envelope = tokio::select! {
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
            match to {
                Some(peer_id) => {
                    if !self.switch.send(id, peer_id, payload).await {
                        tracing::debug!(channel = %id, peer = %peer_id, "switch refused message");
                    }
                }
                None => self.switch.broadcast(id, payload).await,
            }
        }
        lock(&self.channels).remove(&id);
    }

    async fn pump_errors(self: Arc<Self>, mut errors: mpsc::Receiver<PeerError>) {
        loop {
            let error = tokio::select! {
                _ = self.cancel.cancelled() => return,
                error = errors.recv() => match error {
                    Some(error) => error,
                    None => return,
                },
            };
            match error.action {
                PeerErrorAction::None => {
                    tracing::warn!(peer = %error.peer_id, err = %error.error, "peer error");
                }
                PeerErrorAction::Disconnect | PeerErrorAction::Ban => {
                    self.switch
                        .stop_peer_for_error(error.peer_id, error.error)
                        .await;
                }
            }
        }
    }

    async fn push_update(&self, peer_id: PeerId, status: PeerStatus) {
        if self
            .updates
            .send(PeerUpdate { peer_id, status })
            .await
            .is_err()
        {
            tracing::debug!(peer = %peer_id, %status, "peer update subscriber gone");
        }
    }
}

#[async_trait]
impl LegacyReactor for LegacyBridge {
    async fn add_peer(&self, peer_id: PeerId) {
        self.push_update(peer_id, PeerStatus::Up).await;
    }

    async fn remove_peer(&self, peer_id: PeerId, reason: &str) {
        tracing::debug!(peer = %peer_id, reason, "peer removed by switch");
        self.push_update(peer_id, PeerStatus::Down).await;
    }

    async fn receive(&self, channel: ChannelId, peer_id: PeerId, payload: Bytes) {
        let inbound = lock(&self.channels).get(&channel).cloned();
        let Some(inbound) = inbound else {
            tracing::debug!(%channel, peer = %peer_id, "message for unknown channel");
            return;
        };
        match inbound.deliver(peer_id, payload).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%channel, "channel closed, dropping message"),
            Err(e) => {
                tracing::error!(%channel, peer = %peer_id, err = %e, "invalid message");
                self.switch
                    .stop_peer_for_error(peer_id, e.to_string())
                    .await;
            }
        }
    }
}
