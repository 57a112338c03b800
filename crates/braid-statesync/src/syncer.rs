//! The syncer: one state sync session, from discovery to restore.
//!
//! # Phases
//!
//! ```text
//! Idle -> Discovering -> Selecting -> Fetching -> Restoring -> Done
//! ```
//!
//! The session lives in [`Shared`] behind a single mutex. The reactor feeds
//! it snapshots, chunks and peer changes as they arrive; the syncer task
//! drives it forward and sleeps on [`Shared::wake`] in between. The lock is
//! never held across an `.await`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use braid_core::{ChainState, Chunk, Commit, PeerId, Snapshot};
use braid_p2p::ChannelSender;

use crate::app::{RestoredSnapshot, SnapshotApp, StateProvider};
use crate::chunks::ChunkQueue;
use crate::config::StateSyncConfig;
use crate::error::{Result, StateSyncError};
use crate::messages::{ChunkRequest, StateSyncMessage};
use crate::snapshots::SnapshotPool;

/// Where a sync currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Discovering,
    Selecting,
    Fetching,
    Restoring,
    Done { succeeded: bool },
}

/// State shared by the reactor, the syncer and [`StateSyncHandle`](crate::StateSyncHandle)s.
pub(crate) struct Shared {
    state: Mutex<SharedState>,
    pub(crate) wake: Notify,
}

struct SharedState {
    session: Option<Session>,
    phase: SyncPhase,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                session: None,
                phase: SyncPhase::Idle,
            }),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the active session, if any.
    pub(crate) fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.lock().session.as_mut().map(f)
    }

    /// Install a fresh session. Fails if one is active.
    pub(crate) fn install(&self) -> Result<()> {
        let mut state = self.lock();
        if state.session.is_some() {
            return Err(StateSyncError::SyncInProgress);
        }
        state.session = Some(Session::new());
        state.phase = SyncPhase::Idle;
        Ok(())
    }

    /// Drop the active session.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.session = None;
        if !matches!(state.phase, SyncPhase::Done { .. } | SyncPhase::Idle) {
            state.phase = SyncPhase::Done { succeeded: false };
        }
    }

    pub(crate) fn phase(&self) -> SyncPhase {
        self.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        self.lock().phase = phase;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock().session.is_some()
    }
}

/// Clears the session slot when a sync ends, however it ends.
pub(crate) struct SessionGuard<'a> {
    pub(crate) shared: &'a Shared,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.shared.clear();
    }
}

/// Everything known to an active sync.
#[derive(Debug, Default)]
pub(crate) struct Session {
    pool: SnapshotPool,
    peers: BTreeSet<PeerId>,
    fetch: Option<Fetch>,
}

impl Session {
    fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns `true` if it was not known.
    pub(crate) fn add_peer(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    /// Forget a peer as a snapshot source and re-queue its in-flight chunks.
    pub(crate) fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.pool.remove_peer(peer);
        if let Some(fetch) = &mut self.fetch {
            fetch.remove_peer(peer);
        }
    }

    /// Record a snapshot advertisement. Returns `true` if the snapshot is new.
    pub(crate) fn add_snapshot(&mut self, peer: PeerId, snapshot: Snapshot) -> bool {
        self.peers.insert(peer);
        if let Some(fetch) = &mut self.fetch {
            if fetch.queue.snapshot().key() == snapshot.key() {
                fetch.advertisers.insert(peer);
            }
        }
        self.pool.add(peer, snapshot)
    }

    /// Store a fetched chunk.
    ///
    /// `Ok(false)` when nothing is being fetched, the sender does not offer
    /// the selected snapshot, or the index is already retrieved. Chunks that
    /// do not fit the selected snapshot are an error.
    pub(crate) fn add_chunk(&mut self, chunk: Chunk) -> Result<bool> {
        let Some(fetch) = &mut self.fetch else {
            return Ok(false);
        };
        if !fetch.advertisers.contains(&chunk.sender) {
            tracing::debug!(
                peer = %chunk.sender,
                chunk = chunk.index,
                "ignoring chunk from peer not offering the snapshot"
            );
            return Ok(false);
        }
        fetch.queue.add(chunk)
    }

    /// A peer reported it does not have a chunk. Returns `true` if this
    /// answered an outstanding request.
    pub(crate) fn chunk_missing(&mut self, peer: PeerId, height: u64, format: u32, index: u32) -> bool {
        let Some(fetch) = &mut self.fetch else {
            return false;
        };
        let snapshot = fetch.queue.snapshot();
        if snapshot.height != height || snapshot.format != format {
            return false;
        }
        if fetch.queue.requested_from(index) != Some(peer) {
            return false;
        }
        fetch.record_failure(index, "missing");
        true
    }

    pub(crate) fn best_snapshot(&self) -> Option<Snapshot> {
        self.pool.best()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn snapshot_count(&self) -> usize {
        self.pool.len()
    }

    /// Start fetching `snapshot` from the peers that advertised it.
    pub(crate) fn begin_fetch(&mut self, snapshot: Snapshot, config: &StateSyncConfig) {
        let advertisers = self.pool.peers(&snapshot.key()).into_iter().collect();
        self.fetch = Some(Fetch {
            queue: ChunkQueue::new(snapshot),
            advertisers,
            tried: HashMap::new(),
            peer_failures: HashMap::new(),
            max_retries: config.max_chunk_retries,
        });
    }

    /// Advance the fetch. See [`Fetch::poll`].
    pub(crate) fn poll_fetch(&mut self, now: Instant, config: &StateSyncConfig) -> Result<FetchPoll> {
        let fetch = self.fetch.as_mut().ok_or(StateSyncError::NoSnapshots)?;
        match fetch.poll(now, config)? {
            Some(wait) => Ok(wait),
            None => {
                let chunks = self
                    .fetch
                    .take()
                    .and_then(|fetch| fetch.queue.into_chunks())
                    .unwrap_or_default();
                Ok(FetchPoll::Complete(chunks))
            }
        }
    }
}

/// What the fetch loop should do next.
#[derive(Debug)]
pub(crate) enum FetchPoll {
    /// Every chunk is in, in index order.
    Complete(Vec<Bytes>),
    /// Send these requests, then wait for progress or `deadline`.
    Wait {
        requests: Vec<(u32, PeerId)>,
        deadline: Option<Instant>,
    },
}

#[derive(Debug)]
struct Fetch {
    queue: ChunkQueue,
    advertisers: BTreeSet<PeerId>,
    tried: HashMap<u32, HashSet<PeerId>>,
    peer_failures: HashMap<PeerId, u32>,
    max_retries: u32,
}

impl Fetch {
    fn remove_peer(&mut self, peer: &PeerId) {
        self.advertisers.remove(peer);
        for index in self.queue.in_flight_for(peer) {
            self.record_failure(index, "peer disconnected");
        }
    }

    fn record_failure(&mut self, index: u32, reason: &str) {
        let Some((peer, attempts)) = self.queue.fail(index) else {
            return;
        };
        tracing::debug!(peer = %peer, chunk = index, attempts, reason, "chunk request failed");

        let failures = self.peer_failures.entry(peer).or_insert(0);
        *failures += 1;
        if *failures > self.max_retries && self.advertisers.remove(&peer) {
            tracing::warn!(peer = %peer, failures = *failures, "dropping unreliable chunk source");
        }
    }

    /// Expire stale requests and hand out new ones.
    ///
    /// Returns `None` once every chunk is retrieved.
    fn poll(&mut self, now: Instant, config: &StateSyncConfig) -> Result<Option<FetchPoll>> {
        for index in self.queue.expired(now) {
            self.record_failure(index, "timed out");
        }

        if self.queue.is_complete() {
            return Ok(None);
        }
        for index in self.queue.pending() {
            let attempts = self.queue.attempts(index);
            if attempts > self.max_retries {
                return Err(StateSyncError::ChunkRetriesExhausted { index, attempts });
            }
        }
        if self.advertisers.is_empty() {
            return Err(StateSyncError::NoPeers);
        }

        let fetchers = config.chunk_fetchers.max(1);
        let deadline = now + config.chunk_request_timeout;
        let pending: Vec<u32> = self.queue.pending().collect();
        let mut requests = Vec::new();
        for index in pending {
            if self.queue.in_flight_len() >= fetchers {
                break;
            }
            let Some(peer) = self.pick_peer(index) else {
                break;
            };
            if self.queue.dispatch(index, peer, deadline) {
                self.tried.entry(index).or_default().insert(peer);
                requests.push((index, peer));
            }
        }

        Ok(Some(FetchPoll::Wait {
            requests,
            deadline: self.queue.next_deadline(),
        }))
    }

    /// Choose a source for `index`: advertisers not yet tried for it, least
    /// loaded first, ties broken at random. Once every advertiser has been
    /// tried the round starts over.
    fn pick_peer(&mut self, index: u32) -> Option<PeerId> {
        let tried = self.tried.entry(index).or_default();
        if self.advertisers.iter().all(|p| tried.contains(p)) {
            tried.clear();
        }
        let candidates: Vec<PeerId> = self
            .advertisers
            .iter()
            .filter(|p| !tried.contains(p))
            .copied()
            .collect();

        let min_load = candidates.iter().map(|p| self.queue.load(p)).min()?;
        let least_loaded: Vec<PeerId> = candidates
            .into_iter()
            .filter(|p| self.queue.load(p) == min_load)
            .collect();
        least_loaded.choose(&mut rand::thread_rng()).copied()
    }
}

/// Runs one sync against an installed session.
pub(crate) struct Syncer {
    pub(crate) shared: Arc<Shared>,
    pub(crate) app: Arc<dyn SnapshotApp>,
    pub(crate) provider: Arc<dyn StateProvider>,
    pub(crate) chunks: ChannelSender<StateSyncMessage>,
    pub(crate) config: StateSyncConfig,
    pub(crate) cancel: CancellationToken,
}

impl Syncer {
    pub(crate) async fn run(&self, discovery_time: Duration) -> Result<(ChainState, Commit)> {
        self.shared.set_phase(SyncPhase::Discovering);
        tracing::debug!(?discovery_time, "discovering snapshots");
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(StateSyncError::Cancelled),
            _ = tokio::time::sleep(discovery_time) => {}
        }

        self.shared.set_phase(SyncPhase::Selecting);
        let (snapshot, peers, discovered) = self
            .shared
            .with_session(|s| (s.best_snapshot(), s.peer_count(), s.snapshot_count()))
            .ok_or(StateSyncError::Cancelled)?;
        let snapshot = snapshot.ok_or(StateSyncError::NoSnapshots)?;
        tracing::info!(
            height = snapshot.height,
            format = snapshot.format,
            chunks = snapshot.chunks,
            peers,
            discovered,
            "selected snapshot"
        );

        let trusted = self
            .provider
            .app_hash(snapshot.height)
            .await
            .map_err(StateSyncError::provider)?;

        self.shared
            .with_session(|s| s.begin_fetch(snapshot.clone(), &self.config))
            .ok_or(StateSyncError::Cancelled)?;
        self.shared.set_phase(SyncPhase::Fetching);
        let chunks = self.fetch(&snapshot).await?;

        self.shared.set_phase(SyncPhase::Restoring);
        tracing::info!(height = snapshot.height, format = snapshot.format, "restoring snapshot");
        let height = snapshot.height;
        let app_hash = self
            .app
            .apply_restored_snapshot(RestoredSnapshot { snapshot, chunks })
            .await
            .map_err(StateSyncError::app)?;
        if app_hash != trusted {
            return Err(StateSyncError::AppHashMismatch {
                expected: trusted,
                actual: app_hash,
            });
        }

        let state = self
            .provider
            .state(height)
            .await
            .map_err(StateSyncError::provider)?;
        let commit = self
            .provider
            .commit(height)
            .await
            .map_err(StateSyncError::provider)?;
        Ok((state, commit))
    }

    async fn fetch(&self, snapshot: &Snapshot) -> Result<Vec<Bytes>> {
        loop {
            let now = Instant::now();
            let poll = self
                .shared
                .with_session(|s| s.poll_fetch(now, &self.config))
                .ok_or(StateSyncError::Cancelled)??;

            let (requests, deadline) = match poll {
                FetchPoll::Complete(chunks) => return Ok(chunks),
                FetchPoll::Wait { requests, deadline } => (requests, deadline),
            };

            for (index, peer) in requests {
                tracing::debug!(
                    height = snapshot.height,
                    format = snapshot.format,
                    chunk = index,
                    peer = %peer,
                    "requesting chunk"
                );
                let request = ChunkRequest {
                    height: snapshot.height,
                    format: snapshot.format,
                    index,
                };
                self.chunks
                    .to(peer, StateSyncMessage::ChunkRequest(request))
                    .await?;
            }

            let deadline = deadline.unwrap_or(now + self.config.chunk_request_timeout);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StateSyncError::Cancelled),
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}
