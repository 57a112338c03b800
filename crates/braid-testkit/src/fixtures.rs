//! Test fixtures and helpers.
//!
//! Mock collaborators for the state sync reactor and an in-memory network of
//! full nodes for integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::RngCore;

use braid::{Node, NodeConfig};
use braid_core::{AppHash, Blake3Hash, ChainState, Commit, Keypair, PeerId, Snapshot};
use braid_p2p::{MemoryNetwork, Transport};
use braid_statesync::{RestoredSnapshot, SnapshotApp, StateProvider, StateSyncConfig};

/// How long [`TestNetwork`] waits for connections before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic keypair for party `index`.
pub fn keypair(index: u8) -> Keypair {
    let mut seed = [0u8; 32];
    seed[0] = index;
    seed[31] = 0xbd;
    Keypair::from_seed(&seed)
}

/// Deterministic keypairs for multi-party tests.
pub fn keypairs(count: usize) -> Vec<Keypair> {
    (0..count).map(|i| keypair(i as u8)).collect()
}

/// The app hash [`MockApp`] reports after restoring `chunks`.
pub fn app_hash_of(chunks: &[Bytes]) -> AppHash {
    let state: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    AppHash::new(Blake3Hash::hash(&state).0.to_vec())
}

/// A snapshot together with the chunk payloads it describes.
#[derive(Debug, Clone)]
pub struct SnapshotFixture {
    pub snapshot: Snapshot,
    pub chunks: Vec<Bytes>,
}

impl SnapshotFixture {
    /// A snapshot with recognisable payloads (`chunk-<height>-<format>-<i>`).
    pub fn new(height: u64, format: u32, chunks: u32) -> Self {
        let payloads = (0..chunks)
            .map(|i| Bytes::from(format!("chunk-{}-{}-{}", height, format, i)))
            .collect();
        Self::from_chunks(height, format, payloads)
    }

    /// A snapshot whose chunks are `size` random bytes each.
    pub fn random(height: u64, format: u32, chunks: u32, size: usize) -> Self {
        let mut rng = rand::thread_rng();
        let payloads = (0..chunks)
            .map(|_| {
                let mut buf = BytesMut::zeroed(size);
                rng.fill_bytes(&mut buf);
                buf.freeze()
            })
            .collect();
        Self::from_chunks(height, format, payloads)
    }

    /// Describe `chunks`. The snapshot hash covers every payload.
    pub fn from_chunks(height: u64, format: u32, chunks: Vec<Bytes>) -> Self {
        let mut contents = Vec::new();
        for chunk in &chunks {
            contents.extend_from_slice(&Blake3Hash::hash(chunk).0);
        }
        let snapshot = Snapshot {
            height,
            format,
            chunks: chunks.len() as u32,
            hash: Bytes::copy_from_slice(&Blake3Hash::hash(&contents).0),
            metadata: Bytes::new(),
        };
        Self { snapshot, chunks }
    }

    /// The app hash restoring this snapshot yields.
    pub fn app_hash(&self) -> AppHash {
        app_hash_of(&self.chunks)
    }
}

#[derive(Default)]
struct MockAppState {
    snapshots: Vec<SnapshotFixture>,
    hidden: HashSet<(u64, u32, u32)>,
    chunk_requests: Vec<(u64, u32, u32)>,
    restored: Vec<RestoredSnapshot>,
    fail_listing: bool,
    app_hash: Option<AppHash>,
}

/// An in-memory [`SnapshotApp`].
///
/// Serves the snapshots it was given, records every chunk request and every
/// restore, and can be told to hide chunks or fail.
#[derive(Default)]
pub struct MockApp {
    state: Mutex<MockAppState>,
}

impl MockApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// An app holding `fixture`.
    pub fn with_snapshot(fixture: &SnapshotFixture) -> Self {
        let app = Self::new();
        app.add_snapshot(fixture);
        app
    }

    pub fn add_snapshot(&self, fixture: &SnapshotFixture) {
        lock(&self.state).snapshots.push(fixture.clone());
    }

    /// Answer requests for this chunk as missing.
    pub fn hide_chunk(&self, height: u64, format: u32, index: u32) {
        lock(&self.state).hidden.insert((height, format, index));
    }

    /// Make `list_snapshots` fail.
    pub fn fail_listing(&self) {
        lock(&self.state).fail_listing = true;
    }

    /// Report `hash` after any restore instead of hashing the chunks.
    pub fn report_app_hash(&self, hash: AppHash) {
        lock(&self.state).app_hash = Some(hash);
    }

    /// Every `(height, format, index)` asked of `load_chunk`, in order.
    pub fn chunk_requests(&self) -> Vec<(u64, u32, u32)> {
        lock(&self.state).chunk_requests.clone()
    }

    /// Snapshots applied through `apply_restored_snapshot`.
    pub fn restored(&self) -> Vec<RestoredSnapshot> {
        lock(&self.state).restored.clone()
    }
}

#[async_trait]
impl SnapshotApp for MockApp {
    async fn list_snapshots(&self) -> anyhow::Result<Vec<Snapshot>> {
        let state = lock(&self.state);
        if state.fail_listing {
            anyhow::bail!("snapshot store unavailable");
        }
        Ok(state.snapshots.iter().map(|f| f.snapshot.clone()).collect())
    }

    async fn load_chunk(
        &self,
        height: u64,
        format: u32,
        index: u32,
    ) -> anyhow::Result<Option<Bytes>> {
        let mut state = lock(&self.state);
        state.chunk_requests.push((height, format, index));
        if state.hidden.contains(&(height, format, index)) {
            return Ok(None);
        }
        let chunk = state
            .snapshots
            .iter()
            .find(|f| f.snapshot.height == height && f.snapshot.format == format)
            .and_then(|f| f.chunks.get(index as usize).cloned());
        Ok(chunk)
    }

    async fn apply_restored_snapshot(&self, restored: RestoredSnapshot) -> anyhow::Result<AppHash> {
        let mut state = lock(&self.state);
        let hash = match &state.app_hash {
            Some(hash) => hash.clone(),
            None => app_hash_of(&restored.chunks),
        };
        state.restored.push(restored);
        Ok(hash)
    }
}

/// A [`StateProvider`] that trusts the app hashes it was given.
#[derive(Default)]
pub struct MockStateProvider {
    trusted: Mutex<HashMap<u64, AppHash>>,
}

impl MockStateProvider {
    pub const CHAIN_ID: &'static str = "braid-test";

    pub fn new() -> Self {
        Self::default()
    }

    /// A provider vouching for the app hash `fixture` restores to.
    pub fn trusting(fixture: &SnapshotFixture) -> Self {
        let provider = Self::new();
        provider.trust(fixture.snapshot.height, fixture.app_hash());
        provider
    }

    pub fn trust(&self, height: u64, app_hash: AppHash) {
        lock(&self.trusted).insert(height, app_hash);
    }

    fn trusted(&self, height: u64) -> anyhow::Result<AppHash> {
        lock(&self.trusted)
            .get(&height)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no trusted state at height {}", height))
    }

    fn block_hash(height: u64) -> Bytes {
        Bytes::copy_from_slice(&Blake3Hash::hash(&height.to_be_bytes()).0)
    }
}

#[async_trait]
impl StateProvider for MockStateProvider {
    async fn app_hash(&self, height: u64) -> anyhow::Result<AppHash> {
        self.trusted(height)
    }

    async fn state(&self, height: u64) -> anyhow::Result<ChainState> {
        Ok(ChainState {
            chain_id: Self::CHAIN_ID.to_string(),
            initial_height: 1,
            last_block_height: height,
            last_block_hash: Self::block_hash(height),
            app_hash: self.trusted(height)?,
            app_version: 1,
        })
    }

    async fn commit(&self, height: u64) -> anyhow::Result<Commit> {
        Ok(Commit {
            height,
            round: 0,
            block_hash: Self::block_hash(height),
            signatures: Vec::new(),
        })
    }
}

/// State sync settings short enough for tests.
pub fn fast_state_sync() -> StateSyncConfig {
    StateSyncConfig {
        discovery_time: Duration::from_millis(300),
        chunk_request_timeout: Duration::from_millis(500),
        ..StateSyncConfig::default()
    }
}

/// Full nodes joined by a [`MemoryNetwork`].
pub struct TestNetwork {
    network: Arc<MemoryNetwork>,
    nodes: Vec<Node>,
    apps: Vec<Arc<MockApp>>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
            apps: Vec::new(),
        }
    }

    /// Start a node backed by `app`; returns its index.
    pub async fn add_node(&mut self, app: MockApp) -> braid::Result<usize> {
        let config = NodeConfig {
            state_sync: fast_state_sync(),
            ..NodeConfig::default()
        };
        self.add_node_with_config(app, config).await
    }

    pub async fn add_node_with_config(
        &mut self,
        app: MockApp,
        config: NodeConfig,
    ) -> braid::Result<usize> {
        let index = self.nodes.len();
        let keypair = keypair(index as u8);
        let transport: Arc<dyn Transport> =
            Arc::new(self.network.create_transport(&keypair).await);
        let app = Arc::new(app);
        let node = Node::with_transports(keypair, config, vec![transport], app.clone()).await?;
        self.nodes.push(node);
        self.apps.push(app);
        Ok(index)
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn app(&self, index: usize) -> &Arc<MockApp> {
        &self.apps[index]
    }

    pub fn peer_id(&self, index: usize) -> PeerId {
        self.nodes[index].peer_id()
    }

    /// Have `from` dial `to` and wait until both report the connection.
    pub async fn connect(&self, from: usize, to: usize) -> braid::Result<bool> {
        for address in self.nodes[to].addresses() {
            self.nodes[from].add_peer(address).await?;
        }
        let (a, b) = (self.peer_id(from), self.peer_id(to));
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                if self.nodes[from].connected_peers().contains(&b)
                    && self.nodes[to].connected_peers().contains(&a)
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        Ok(connected.is_ok())
    }

    /// Stop every node.
    pub async fn stop(self) {
        for node in self.nodes {
            node.stop().await;
        }
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}
