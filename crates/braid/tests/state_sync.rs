//! End-to-end state sync between full nodes on an in-memory network.

use std::sync::Arc;
use std::time::Duration;

use braid::{AppHash, NodeError, StateSyncError, SyncPhase};
use braid_testkit::{MockApp, MockStateProvider, SnapshotFixture, TestNetwork};

const DISCOVERY: Duration = Duration::from_millis(400);
const TIMEOUT: Duration = Duration::from_secs(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Servers `0..servers.len()` and an empty client as the last node, with the
/// client dialing every server.
async fn network(servers: Vec<MockApp>) -> (TestNetwork, usize) {
    let mut net = TestNetwork::new();
    for app in servers {
        net.add_node(app).await.unwrap();
    }
    let client = net.add_node(MockApp::new()).await.unwrap();
    for server in 0..client {
        assert!(net.connect(client, server).await.unwrap(), "nodes did not connect");
    }
    (net, client)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_advertisers_complete_the_sync() {
    init_tracing();
    let fixture = SnapshotFixture::new(100, 1, 3);
    let (net, client) = network(vec![
        MockApp::with_snapshot(&fixture),
        MockApp::with_snapshot(&fixture),
    ])
    .await;

    let provider = Arc::new(MockStateProvider::trusting(&fixture));
    let (state, commit) = tokio::time::timeout(TIMEOUT, net.node(client).state_sync(provider, DISCOVERY))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(state.last_block_height, 100);
    assert_eq!(state.app_hash, fixture.app_hash());
    assert_eq!(commit.height, 100);

    let restored = net.app(client).restored();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].snapshot, fixture.snapshot);
    assert_eq!(restored[0].chunks, fixture.chunks);

    // Every index was served by one of the two advertisers.
    let mut served: Vec<u32> = (0..2)
        .flat_map(|i| net.app(i).chunk_requests())
        .map(|(_, _, index)| index)
        .collect();
    served.sort_unstable();
    served.dedup();
    assert_eq!(served, vec![0, 1, 2]);

    assert_eq!(net.node(client).state_sync_phase(), SyncPhase::Done { succeeded: true });
    net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_chunk_is_fetched_from_another_peer() {
    init_tracing();
    let fixture = SnapshotFixture::new(100, 1, 3);
    let holey = MockApp::with_snapshot(&fixture);
    holey.hide_chunk(100, 1, 1);
    let (net, client) = network(vec![holey, MockApp::with_snapshot(&fixture)]).await;

    let provider = Arc::new(MockStateProvider::trusting(&fixture));
    tokio::time::timeout(TIMEOUT, net.node(client).state_sync(provider, DISCOVERY))
        .await
        .unwrap()
        .unwrap();

    let restored = net.app(client).restored();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].chunks[1], fixture.chunks[1]);
    assert!(net.app(1).chunk_requests().contains(&(100, 1, 1)));
    net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_best_snapshot_is_restored() {
    init_tracing();
    let old = SnapshotFixture::new(90, 1, 2);
    let current = SnapshotFixture::new(100, 1, 3);
    let newer_format = SnapshotFixture::new(100, 2, 2);

    let a = MockApp::with_snapshot(&old);
    a.add_snapshot(&current);
    let b = MockApp::with_snapshot(&newer_format);
    let (net, client) = network(vec![a, b]).await;

    let provider = Arc::new(MockStateProvider::trusting(&newer_format));
    tokio::time::timeout(TIMEOUT, net.node(client).state_sync(provider, DISCOVERY))
        .await
        .unwrap()
        .unwrap();

    let restored = net.app(client).restored();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].snapshot, newer_format.snapshot);
    net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_discovery_finds_no_snapshot() {
    init_tracing();
    let (net, client) = network(vec![MockApp::new()]).await;

    let provider = Arc::new(MockStateProvider::new());
    let result = tokio::time::timeout(TIMEOUT, net.node(client).state_sync(provider, DISCOVERY))
        .await
        .unwrap();

    match result {
        Err(NodeError::StateSync(StateSyncError::NoSnapshots)) => {}
        other => panic!("expected no snapshots, got {:?}", other),
    }
    assert!(net.app(client).restored().is_empty());
    assert_eq!(net.node(client).state_sync_phase(), SyncPhase::Done { succeeded: false });

    // The slot is free again.
    let provider = Arc::new(MockStateProvider::new());
    let again = net.node(client).state_sync(provider, Duration::from_millis(50)).await;
    assert!(matches!(
        again,
        Err(NodeError::StateSync(StateSyncError::NoSnapshots))
    ));
    net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_sync_is_rejected_while_one_runs() {
    init_tracing();
    let (net, client) = network(vec![MockApp::new()]).await;
    let handle = net.node(client).state_sync_handle();

    let first = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .sync(Arc::new(MockStateProvider::new()), Duration::from_secs(2))
                .await
        }
    });
    tokio::time::timeout(TIMEOUT, async {
        while handle.phase() != SyncPhase::Discovering {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let second = net
        .node(client)
        .state_sync(Arc::new(MockStateProvider::new()), DISCOVERY)
        .await;
    assert!(matches!(
        second,
        Err(NodeError::StateSync(StateSyncError::SyncInProgress))
    ));
    assert!(handle.is_syncing());
    assert_eq!(handle.phase(), SyncPhase::Discovering);

    // The running sync is unaffected and ends on its own terms.
    assert!(matches!(
        first.await.unwrap(),
        Err(StateSyncError::NoSnapshots)
    ));
    net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_untrusted_app_hash_fails_the_sync() {
    init_tracing();
    let fixture = SnapshotFixture::new(50, 1, 2);
    let (net, client) = network(vec![MockApp::with_snapshot(&fixture)]).await;
    net.app(client).report_app_hash(AppHash::new(vec![0xee; 32]));

    let provider = Arc::new(MockStateProvider::trusting(&fixture));
    let result = tokio::time::timeout(TIMEOUT, net.node(client).state_sync(provider, DISCOVERY))
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(NodeError::StateSync(StateSyncError::AppHashMismatch { .. }))
    ));
    assert_eq!(net.app(client).restored().len(), 1);
    net.stop().await;
}
