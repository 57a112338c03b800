//! The state sync reactor.
//!
//! Serves snapshots and chunks to peers at all times, and feeds what peers
//! send back into the active sync session, if there is one. A sync is
//! started through a [`StateSyncHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use braid_core::{ChainState, Chunk, Commit, PeerId, PeerStatus, Snapshot};
use braid_p2p::{Channel, ChannelSender, Envelope, PeerError, PeerUpdate, PeerUpdates, Router};

use crate::app::{SnapshotApp, StateProvider};
use crate::config::StateSyncConfig;
use crate::error::{Result, StateSyncError};
use crate::messages::{
    chunk_channel, snapshot_channel, ChunkResponse, SnapshotsRequest, StateSyncMessage,
    RECENT_SNAPSHOTS,
};
use crate::syncer::{SessionGuard, Shared, SyncPhase, Syncer};

/// Dispatch loop over the snapshot channel, the chunk channel and peer
/// updates.
pub struct Reactor {
    app: Arc<dyn SnapshotApp>,
    snapshots: Channel<StateSyncMessage>,
    chunks: Channel<StateSyncMessage>,
    snapshot_tx: ChannelSender<StateSyncMessage>,
    chunk_tx: ChannelSender<StateSyncMessage>,
    peer_updates: PeerUpdates,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Reactor {
    /// Build a reactor over already opened channels.
    ///
    /// `cancel` stops both the dispatch loop and any sync in progress.
    pub fn new(
        app: Arc<dyn SnapshotApp>,
        snapshots: Channel<StateSyncMessage>,
        chunks: Channel<StateSyncMessage>,
        peer_updates: PeerUpdates,
        config: StateSyncConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, StateSyncHandle)> {
        let snapshot_tx = snapshots.sender()?;
        let chunk_tx = chunks.sender()?;
        let shared = Arc::new(Shared::new());

        let handle = StateSyncHandle {
            shared: Arc::clone(&shared),
            app: Arc::clone(&app),
            snapshot_tx: snapshot_tx.clone(),
            chunk_tx: chunk_tx.clone(),
            config,
            cancel: cancel.clone(),
        };
        let reactor = Self {
            app,
            snapshots,
            chunks,
            snapshot_tx,
            chunk_tx,
            peer_updates,
            shared,
            cancel,
        };
        Ok((reactor, handle))
    }

    /// Open the state sync channels on `router` and build a reactor.
    pub async fn open(
        router: &Router,
        app: Arc<dyn SnapshotApp>,
        config: StateSyncConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, StateSyncHandle)> {
        let snapshots = router.open_channel::<StateSyncMessage>(snapshot_channel())?;
        let chunks = router.open_channel::<StateSyncMessage>(chunk_channel())?;
        let peer_updates = router.subscribe_peer_updates().await;
        Self::new(app, snapshots, chunks, peer_updates, config, cancel)
    }

    /// Run until cancelled or until the router goes away.
    pub async fn run(mut self) {
        tracing::info!("state sync reactor started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = self.snapshots.recv() => match envelope {
                    Some(envelope) => self.handle_snapshot_message(envelope).await,
                    None => break,
                },
                envelope = self.chunks.recv() => match envelope {
                    Some(envelope) => self.handle_chunk_message(envelope).await,
                    None => break,
                },
                update = self.peer_updates.recv() => match update {
                    Some(update) => self.handle_peer_update(update).await,
                    None => break,
                },
            }
        }
        tracing::info!("state sync reactor stopped");
    }

    async fn handle_snapshot_message(&self, envelope: Envelope<StateSyncMessage>) {
        let Some(from) = envelope.from else {
            return;
        };
        if let Err(e) = envelope.message.validate() {
            self.violation(&self.snapshot_tx, from, e).await;
            return;
        }

        match envelope.message {
            StateSyncMessage::SnapshotsRequest(_) => {
                let snapshots = match self.recent_snapshots().await {
                    Ok(snapshots) => snapshots,
                    Err(e) => {
                        tracing::error!(err = %e, "failed to fetch snapshots");
                        return;
                    }
                };
                for snapshot in snapshots {
                    tracing::debug!(
                        height = snapshot.height,
                        format = snapshot.format,
                        peer = %from,
                        "advertising snapshot"
                    );
                    let response = StateSyncMessage::SnapshotsResponse(snapshot.into());
                    if let Err(e) = self.snapshot_tx.to(from, response).await {
                        tracing::debug!(err = %e, "snapshot channel closed");
                        return;
                    }
                }
            }
            StateSyncMessage::SnapshotsResponse(response) => {
                let snapshot = Snapshot::from(response);
                let (height, format) = (snapshot.height, snapshot.format);
                match self.shared.with_session(|s| s.add_snapshot(from, snapshot)) {
                    None => {
                        tracing::debug!(peer = %from, "received unexpected snapshot, no state sync in progress")
                    }
                    Some(true) => {
                        tracing::debug!(height, format, peer = %from, "received snapshot")
                    }
                    Some(false) => {
                        tracing::debug!(height, format, peer = %from, "received known snapshot")
                    }
                }
            }
            other => {
                let e = StateSyncError::InvalidMessage(format!(
                    "unexpected {} on snapshot channel",
                    other.kind()
                ));
                self.violation(&self.snapshot_tx, from, e).await;
            }
        }
    }

    async fn handle_chunk_message(&self, envelope: Envelope<StateSyncMessage>) {
        let Some(from) = envelope.from else {
            return;
        };
        if let Err(e) = envelope.message.validate() {
            self.violation(&self.chunk_tx, from, e).await;
            return;
        }

        match envelope.message {
            StateSyncMessage::ChunkRequest(request) => {
                tracing::debug!(
                    height = request.height,
                    format = request.format,
                    chunk = request.index,
                    peer = %from,
                    "received chunk request"
                );
                let loaded = self
                    .app
                    .load_chunk(request.height, request.format, request.index)
                    .await;
                let chunk = match loaded {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let err = format!("{:#}", e);
                        tracing::error!(
                            height = request.height,
                            format = request.format,
                            chunk = request.index,
                            peer = %from,
                            err = %err,
                            "failed to load chunk"
                        );
                        return;
                    }
                };
                let response = ChunkResponse {
                    height: request.height,
                    format: request.format,
                    index: request.index,
                    missing: chunk.is_none(),
                    chunk: chunk.unwrap_or_default(),
                };
                tracing::debug!(
                    height = response.height,
                    format = response.format,
                    chunk = response.index,
                    missing = response.missing,
                    peer = %from,
                    "sending chunk"
                );
                if let Err(e) = self
                    .chunk_tx
                    .to(from, StateSyncMessage::ChunkResponse(response))
                    .await
                {
                    tracing::debug!(err = %e, "chunk channel closed");
                }
            }
            StateSyncMessage::ChunkResponse(response) => {
                self.handle_chunk_response(from, response).await
            }
            other => {
                let e = StateSyncError::InvalidMessage(format!(
                    "unexpected {} on chunk channel",
                    other.kind()
                ));
                self.violation(&self.chunk_tx, from, e).await;
            }
        }
    }

    async fn handle_chunk_response(&self, from: PeerId, response: ChunkResponse) {
        let ChunkResponse {
            height,
            format,
            index,
            chunk,
            missing,
        } = response;

        if missing {
            match self
                .shared
                .with_session(|s| s.chunk_missing(from, height, format, index))
            {
                None => tracing::debug!(peer = %from, "received unexpected chunk, no state sync in progress"),
                Some(answered) => {
                    tracing::debug!(height, format, chunk = index, peer = %from, answered, "peer is missing chunk");
                    if answered {
                        self.shared.wake.notify_one();
                    }
                }
            }
            return;
        }

        let chunk = Chunk {
            height,
            format,
            index,
            payload: chunk,
            sender: from,
        };
        match self.shared.with_session(|s| s.add_chunk(chunk)) {
            None => {
                tracing::debug!(peer = %from, "received unexpected chunk, no state sync in progress")
            }
            Some(Ok(true)) => {
                tracing::debug!(height, format, chunk = index, peer = %from, "received chunk, adding to sync");
                self.shared.wake.notify_one();
            }
            Some(Ok(false)) => {
                tracing::debug!(height, format, chunk = index, peer = %from, "ignoring chunk")
            }
            Some(Err(e)) => self.violation(&self.chunk_tx, from, e).await,
        }
    }

    async fn handle_peer_update(&self, update: PeerUpdate) {
        let PeerUpdate { peer_id, status } = update;
        tracing::debug!(peer = %peer_id, %status, "peer update");
        match status {
            PeerStatus::Up => {
                let joined = self.shared.with_session(|s| s.add_peer(peer_id));
                if joined == Some(true) {
                    tracing::debug!(peer = %peer_id, "requesting snapshots from new peer");
                    let request = StateSyncMessage::SnapshotsRequest(SnapshotsRequest {});
                    if let Err(e) = self.snapshot_tx.to(peer_id, request).await {
                        tracing::debug!(err = %e, "snapshot channel closed");
                    }
                }
            }
            PeerStatus::Down | PeerStatus::Removed | PeerStatus::Banned => {
                if self
                    .shared
                    .with_session(|s| s.remove_peer(&peer_id))
                    .is_some()
                {
                    self.shared.wake.notify_one();
                }
            }
            PeerStatus::New => {}
        }
    }

    async fn violation(
        &self,
        sender: &ChannelSender<StateSyncMessage>,
        peer: PeerId,
        error: StateSyncError,
    ) {
        tracing::error!(peer = %peer, channel = %sender.id(), err = %error, "protocol violation");
        if let Err(e) = sender.report_error(PeerError::disconnect(peer, error)).await {
            tracing::debug!(err = %e, "could not report peer error");
        }
    }

    /// The most recent local snapshots, best first.
    async fn recent_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = self
            .app
            .list_snapshots()
            .await
            .map_err(StateSyncError::app)?;
        snapshots.sort_by(|a, b| a.rank_cmp(b));
        snapshots.truncate(RECENT_SNAPSHOTS);
        Ok(snapshots)
    }
}

/// Starts syncs on a running [`Reactor`]. Cheap to clone.
#[derive(Clone)]
pub struct StateSyncHandle {
    shared: Arc<Shared>,
    app: Arc<dyn SnapshotApp>,
    snapshot_tx: ChannelSender<StateSyncMessage>,
    chunk_tx: ChannelSender<StateSyncMessage>,
    config: StateSyncConfig,
    cancel: CancellationToken,
}

impl StateSyncHandle {
    /// Discover, fetch and restore a snapshot, returning the chain state and
    /// commit at its height.
    ///
    /// Fails with [`StateSyncError::SyncInProgress`] right away if another
    /// sync is running; that sync is not affected. The caller is
    /// responsible for persisting the returned state.
    pub async fn sync(
        &self,
        provider: Arc<dyn StateProvider>,
        discovery_time: Duration,
    ) -> Result<(ChainState, Commit)> {
        self.shared.install()?;
        let _guard = SessionGuard {
            shared: &self.shared,
        };
        tracing::info!(?discovery_time, "starting state sync");

        tracing::debug!("requesting snapshots from known peers");
        self.snapshot_tx
            .broadcast(StateSyncMessage::SnapshotsRequest(SnapshotsRequest {}))
            .await?;

        let syncer = Syncer {
            shared: Arc::clone(&self.shared),
            app: Arc::clone(&self.app),
            provider,
            chunks: self.chunk_tx.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        };
        let result = syncer.run(discovery_time).await;

        self.shared.set_phase(SyncPhase::Done {
            succeeded: result.is_ok(),
        });
        match &result {
            Ok((state, _)) => tracing::info!(
                height = state.last_block_height,
                app_hash = %state.app_hash,
                "state sync complete"
            ),
            Err(e) => tracing::warn!(err = %e, "state sync failed"),
        }
        result
    }

    /// Phase of the current or most recent sync.
    pub fn phase(&self) -> SyncPhase {
        self.shared.phase()
    }

    pub fn is_syncing(&self) -> bool {
        self.shared.is_active()
    }

    pub fn config(&self) -> &StateSyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use braid_core::AppHash;
    use braid_p2p::{
        decode_message, encode_message, ChannelId, LegacyBridge, LegacyReactor, LegacySwitch,
    };

    use crate::app::RestoredSnapshot;
    use crate::messages::{ChunkRequest, SnapshotsResponse, CHUNK_CHANNEL, SNAPSHOT_CHANNEL};

    #[derive(Debug)]
    enum Event {
        Send(ChannelId, PeerId, StateSyncMessage),
        Broadcast(ChannelId, StateSyncMessage),
        Stop(PeerId),
    }

    struct Switch {
        events: mpsc::UnboundedSender<Event>,
    }

    #[async_trait]
    impl LegacySwitch for Switch {
        async fn send(&self, channel: ChannelId, peer: PeerId, payload: Bytes) -> bool {
            match decode_message(&payload) {
                Ok(msg) => self.events.send(Event::Send(channel, peer, msg)).is_ok(),
                Err(_) => false,
            }
        }

        async fn broadcast(&self, channel: ChannelId, payload: Bytes) {
            if let Ok(msg) = decode_message(&payload) {
                let _ = self.events.send(Event::Broadcast(channel, msg));
            }
        }

        async fn stop_peer_for_error(&self, peer: PeerId, _reason: String) {
            let _ = self.events.send(Event::Stop(peer));
        }
    }

    #[derive(Default)]
    struct TestApp {
        snapshots: Vec<Snapshot>,
        chunks: HashMap<u32, Bytes>,
        app_hash: AppHash,
        restored: Mutex<Vec<RestoredSnapshot>>,
    }

    #[async_trait]
    impl SnapshotApp for TestApp {
        async fn list_snapshots(&self) -> anyhow::Result<Vec<Snapshot>> {
            Ok(self.snapshots.clone())
        }

        async fn load_chunk(
            &self,
            height: u64,
            format: u32,
            index: u32,
        ) -> anyhow::Result<Option<Bytes>> {
            let held = self
                .snapshots
                .iter()
                .any(|s| s.height == height && s.format == format);
            Ok(held.then(|| self.chunks.get(&index).cloned()).flatten())
        }

        async fn apply_restored_snapshot(
            &self,
            restored: RestoredSnapshot,
        ) -> anyhow::Result<AppHash> {
            self.restored.lock().unwrap().push(restored);
            Ok(self.app_hash.clone())
        }
    }

    struct TestProvider {
        app_hash: AppHash,
    }

    #[async_trait]
    impl StateProvider for TestProvider {
        async fn app_hash(&self, _height: u64) -> anyhow::Result<AppHash> {
            Ok(self.app_hash.clone())
        }

        async fn state(&self, height: u64) -> anyhow::Result<ChainState> {
            Ok(ChainState {
                chain_id: "test-chain".into(),
                initial_height: 1,
                last_block_height: height,
                last_block_hash: Bytes::from_static(b"block"),
                app_hash: self.app_hash.clone(),
                app_version: 1,
            })
        }

        async fn commit(&self, height: u64) -> anyhow::Result<Commit> {
            Ok(Commit {
                height,
                round: 0,
                block_hash: Bytes::from_static(b"block"),
                signatures: Vec::new(),
            })
        }
    }

    struct Harness {
        bridge: Arc<LegacyBridge>,
        handle: StateSyncHandle,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn deliver(&self, channel: u16, from: PeerId, msg: StateSyncMessage) {
            self.bridge
                .receive(ChannelId(channel), from, encode_message(msg).unwrap())
                .await;
        }
    }

    fn start(
        app: Arc<TestApp>,
        config: StateSyncConfig,
    ) -> (Harness, mpsc::UnboundedReceiver<Event>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let (tx, rx) = mpsc::unbounded_channel();
        let (bridge, updates) = LegacyBridge::new(Arc::new(Switch { events: tx }), 64);
        let snapshots = bridge
            .open_channel::<StateSyncMessage>(snapshot_channel())
            .unwrap();
        let chunks = bridge
            .open_channel::<StateSyncMessage>(chunk_channel())
            .unwrap();
        let cancel = CancellationToken::new();
        let (reactor, handle) =
            Reactor::new(app, snapshots, chunks, updates, config, cancel.clone()).unwrap();
        tokio::spawn(reactor.run());
        (
            Harness {
                bridge,
                handle,
                cancel,
            },
            rx,
        )
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 20])
    }

    fn snapshot(height: u64, format: u32, chunks: u32) -> Snapshot {
        Snapshot {
            height,
            format,
            chunks,
            hash: Bytes::from_static(b"H"),
            metadata: Bytes::new(),
        }
    }

    fn provider(app_hash: &AppHash) -> Arc<dyn StateProvider> {
        Arc::new(TestProvider {
            app_hash: app_hash.clone(),
        })
    }

    fn fast_config() -> StateSyncConfig {
        StateSyncConfig {
            chunk_request_timeout: Duration::from_secs(1),
            ..StateSyncConfig::default()
        }
    }

    /// Answers on behalf of remote peers. `serving` maps each peer to
    /// whether it actually holds the chunks it advertises.
    fn spawn_remote(
        bridge: Arc<LegacyBridge>,
        mut events: mpsc::UnboundedReceiver<Event>,
        serving: Vec<(PeerId, bool)>,
        offered: Snapshot,
        chunks: Vec<Bytes>,
    ) -> (JoinHandle<()>, Arc<Mutex<Vec<(u32, PeerId)>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            let reply = |channel: u16, from: PeerId, msg: StateSyncMessage| {
                let bridge = Arc::clone(&bridge);
                async move {
                    bridge
                        .receive(ChannelId(channel), from, encode_message(msg).unwrap())
                        .await
                }
            };
            while let Some(event) = events.recv().await {
                match event {
                    Event::Broadcast(_, StateSyncMessage::SnapshotsRequest(_)) => {
                        for (from, _) in &serving {
                            let advert = StateSyncMessage::SnapshotsResponse(offered.clone().into());
                            reply(SNAPSHOT_CHANNEL, *from, advert).await;
                        }
                    }
                    Event::Send(_, to, StateSyncMessage::ChunkRequest(request)) => {
                        log.lock().unwrap().push((request.index, to));
                        let has = serving.iter().any(|(p, has)| *p == to && *has);
                        let chunk = chunks.get(request.index as usize).cloned();
                        let response = ChunkResponse {
                            height: request.height,
                            format: request.format,
                            index: request.index,
                            missing: !has || chunk.is_none(),
                            chunk: if has { chunk.unwrap_or_default() } else { Bytes::new() },
                        };
                        reply(CHUNK_CHANNEL, to, StateSyncMessage::ChunkResponse(response)).await;
                    }
                    _ => {}
                }
            }
        });
        (task, requests)
    }

    #[tokio::test]
    async fn test_serves_recent_snapshots_best_first() {
        let mut snapshots: Vec<Snapshot> = (1..=12).map(|h| snapshot(h, 1, 1)).collect();
        snapshots.push(snapshot(12, 2, 1));
        let app = Arc::new(TestApp {
            snapshots,
            ..TestApp::default()
        });
        let (harness, mut events) = start(app, fast_config());

        harness
            .deliver(
                SNAPSHOT_CHANNEL,
                peer(1),
                StateSyncMessage::SnapshotsRequest(SnapshotsRequest {}),
            )
            .await;

        let mut advertised = Vec::new();
        for _ in 0..RECENT_SNAPSHOTS {
            match next(&mut events).await {
                Event::Send(ch, to, StateSyncMessage::SnapshotsResponse(r)) => {
                    assert_eq!(ch, ChannelId(SNAPSHOT_CHANNEL));
                    assert_eq!(to, peer(1));
                    advertised.push((r.height, r.format));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        let mut expected = vec![(12, 2), (12, 1)];
        expected.extend((4..=11).rev().map(|h| (h, 1)));
        assert_eq!(advertised, expected);
    }

    #[tokio::test]
    async fn test_serves_chunk_or_missing() {
        let mut chunks = HashMap::new();
        chunks.insert(0, Bytes::from_static(b"zero"));
        let app = Arc::new(TestApp {
            snapshots: vec![snapshot(5, 1, 2)],
            chunks,
            ..TestApp::default()
        });
        let (harness, mut events) = start(app, fast_config());

        for index in 0..2 {
            let request = ChunkRequest {
                height: 5,
                format: 1,
                index,
            };
            harness
                .deliver(CHUNK_CHANNEL, peer(2), StateSyncMessage::ChunkRequest(request))
                .await;
        }

        match next(&mut events).await {
            Event::Send(_, to, StateSyncMessage::ChunkResponse(r)) => {
                assert_eq!(to, peer(2));
                assert_eq!((r.index, r.missing), (0, false));
                assert_eq!(r.chunk, Bytes::from_static(b"zero"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match next(&mut events).await {
            Event::Send(_, _, StateSyncMessage::ChunkResponse(r)) => {
                assert_eq!((r.index, r.missing), (1, true));
                assert!(r.chunk.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_without_session_is_discarded() {
        let app = Arc::new(TestApp {
            snapshots: vec![snapshot(5, 1, 1)],
            ..TestApp::default()
        });
        let (harness, mut events) = start(app, fast_config());

        let advert = StateSyncMessage::SnapshotsResponse(snapshot(9, 1, 1).into());
        harness.deliver(SNAPSHOT_CHANNEL, peer(3), advert).await;
        harness
            .deliver(
                SNAPSHOT_CHANNEL,
                peer(3),
                StateSyncMessage::SnapshotsRequest(SnapshotsRequest {}),
            )
            .await;

        assert!(matches!(
            next(&mut events).await,
            Event::Send(_, _, StateSyncMessage::SnapshotsResponse(_))
        ));
        assert_eq!(harness.handle.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_invalid_message_disconnects_peer() {
        let (harness, mut events) = start(Arc::new(TestApp::default()), fast_config());

        let advert = StateSyncMessage::SnapshotsResponse(SnapshotsResponse {
            height: 0,
            format: 1,
            chunks: 1,
            hash: Bytes::from_static(b"H"),
            metadata: Bytes::new(),
        });
        harness.deliver(SNAPSHOT_CHANNEL, peer(4), advert).await;
        assert!(matches!(next(&mut events).await, Event::Stop(p) if p == peer(4)));
    }

    #[tokio::test]
    async fn test_message_on_wrong_channel_disconnects_peer() {
        let (harness, mut events) = start(Arc::new(TestApp::default()), fast_config());

        let request = StateSyncMessage::ChunkRequest(ChunkRequest {
            height: 1,
            format: 1,
            index: 0,
        });
        harness.deliver(SNAPSHOT_CHANNEL, peer(5), request).await;
        assert!(matches!(next(&mut events).await, Event::Stop(p) if p == peer(5)));
    }

    #[tokio::test]
    async fn test_concurrent_sync_rejected() {
        let app_hash = AppHash::new(Bytes::from_static(b"app"));
        let (harness, mut events) = start(Arc::new(TestApp::default()), fast_config());

        let first = {
            let handle = harness.handle.clone();
            let provider = provider(&app_hash);
            tokio::spawn(async move { handle.sync(provider, Duration::from_secs(30)).await })
        };
        assert!(matches!(
            next(&mut events).await,
            Event::Broadcast(_, StateSyncMessage::SnapshotsRequest(_))
        ));
        assert!(harness.handle.is_syncing());

        let second = tokio::time::timeout(
            Duration::from_secs(1),
            harness.handle.sync(provider(&app_hash), Duration::from_secs(30)),
        )
        .await
        .unwrap();
        assert!(matches!(second, Err(StateSyncError::SyncInProgress)));
        assert!(harness.handle.is_syncing());
        assert_eq!(harness.handle.phase(), SyncPhase::Discovering);

        harness.cancel.cancel();
        let first = first.await.unwrap();
        assert!(matches!(first, Err(StateSyncError::Cancelled)));
        assert!(!harness.handle.is_syncing());
    }

    #[tokio::test]
    async fn test_empty_discovery_finds_no_snapshot() {
        let app_hash = AppHash::new(Bytes::from_static(b"app"));
        let (harness, _events) = start(Arc::new(TestApp::default()), fast_config());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            harness
                .handle
                .sync(provider(&app_hash), Duration::from_millis(50)),
        )
        .await
        .unwrap();
        match result {
            Err(e @ StateSyncError::NoSnapshots) => {
                assert_eq!(e.to_string(), "no suitable snapshot found")
            }
            other => panic!("expected no snapshots, got {:?}", other),
        }
        assert!(!harness.handle.is_syncing());
        assert_eq!(
            harness.handle.phase(),
            SyncPhase::Done { succeeded: false }
        );
    }

    #[tokio::test]
    async fn test_new_peer_asked_for_snapshots_during_sync() {
        let app_hash = AppHash::new(Bytes::from_static(b"app"));
        let (harness, mut events) = start(Arc::new(TestApp::default()), fast_config());

        let sync = {
            let handle = harness.handle.clone();
            let provider = provider(&app_hash);
            tokio::spawn(async move { handle.sync(provider, Duration::from_secs(30)).await })
        };
        assert!(matches!(
            next(&mut events).await,
            Event::Broadcast(_, StateSyncMessage::SnapshotsRequest(_))
        ));

        harness.bridge.add_peer(peer(6)).await;
        match next(&mut events).await {
            Event::Send(ch, to, StateSyncMessage::SnapshotsRequest(_)) => {
                assert_eq!(ch, ChannelId(SNAPSHOT_CHANNEL));
                assert_eq!(to, peer(6));
            }
            other => panic!("unexpected event {:?}", other),
        }

        harness.cancel.cancel();
        let _ = sync.await;
    }

    #[tokio::test]
    async fn test_two_advertisers_complete_sync() {
        let app_hash = AppHash::new(Bytes::from_static(b"restored"));
        let app = Arc::new(TestApp {
            app_hash: app_hash.clone(),
            ..TestApp::default()
        });
        let (harness, events) = start(Arc::clone(&app), fast_config());

        let offered = snapshot(100, 1, 3);
        let chunks: Vec<Bytes> = vec![
            Bytes::from_static(b"c0"),
            Bytes::from_static(b"c1"),
            Bytes::from_static(b"c2"),
        ];
        let (remote, _) = spawn_remote(
            Arc::clone(&harness.bridge),
            events,
            vec![(peer(0xa), true), (peer(0xb), true)],
            offered.clone(),
            chunks.clone(),
        );

        let (state, commit) = tokio::time::timeout(
            Duration::from_secs(10),
            harness
                .handle
                .sync(provider(&app_hash), Duration::from_millis(200)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(state.last_block_height, 100);
        assert_eq!(commit.height, 100);
        let restored = app.restored.lock().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].snapshot, offered);
        assert_eq!(restored[0].chunks, chunks);
        assert_eq!(
            harness.handle.phase(),
            SyncPhase::Done { succeeded: true }
        );
        remote.abort();
    }

    #[tokio::test]
    async fn test_missing_chunk_retried_on_other_peer() {
        let app_hash = AppHash::new(Bytes::from_static(b"restored"));
        let app = Arc::new(TestApp {
            app_hash: app_hash.clone(),
            ..TestApp::default()
        });
        let (harness, events) = start(Arc::clone(&app), fast_config());

        let chunks: Vec<Bytes> = (0..4u8).map(|i| Bytes::from(vec![i])).collect();
        let (remote, requests) = spawn_remote(
            Arc::clone(&harness.bridge),
            events,
            vec![(peer(0xa), false), (peer(0xb), true)],
            snapshot(100, 1, 4),
            chunks.clone(),
        );

        tokio::time::timeout(
            Duration::from_secs(10),
            harness
                .handle
                .sync(provider(&app_hash), Duration::from_millis(200)),
        )
        .await
        .unwrap()
        .unwrap();

        let requests = requests.lock().unwrap().clone();
        for (pos, (index, to)) in requests.iter().enumerate() {
            if *to == peer(0xa) {
                assert!(
                    requests[pos + 1..]
                        .iter()
                        .any(|(i, p)| i == index && *p == peer(0xb)),
                    "chunk {} never retried elsewhere",
                    index
                );
            }
        }
        assert_eq!(app.restored.lock().unwrap()[0].chunks, chunks);
        remote.abort();
    }

    #[tokio::test]
    async fn test_app_hash_mismatch_fails_sync() {
        let app = Arc::new(TestApp {
            app_hash: AppHash::new(Bytes::from_static(b"wrong")),
            ..TestApp::default()
        });
        let (harness, events) = start(Arc::clone(&app), fast_config());
        let (remote, _) = spawn_remote(
            Arc::clone(&harness.bridge),
            events,
            vec![(peer(0xa), true)],
            snapshot(100, 1, 1),
            vec![Bytes::from_static(b"only")],
        );

        let trusted = AppHash::new(Bytes::from_static(b"trusted"));
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            harness
                .handle
                .sync(provider(&trusted), Duration::from_millis(100)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(StateSyncError::AppHashMismatch { .. })));
        assert!(!harness.handle.is_syncing());
        remote.abort();
    }
}
