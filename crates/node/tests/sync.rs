mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use headerd::session::SessionConfig;
use headerd::sync::{SyncMode, SyncOrchestrator, SyncSettings, SyncShared};
use headerd_chainstate::NoopListener;

use common::{
    eventually, magic, memory_engine, mine, mine_chain, regtest, CommitGate, FakePeer,
};

const WAIT: Duration = Duration::from_secs(30);

fn peer_addr() -> SocketAddr {
    "127.0.0.1:18444".parse().expect("addr")
}

fn settings() -> SyncSettings {
    let params = regtest();
    let mut settings = SyncSettings::new(Vec::new(), params.default_port, 8, params.ibd_height_drift);
    settings.tick = Duration::from_millis(50);
    settings.shutdown_grace = Duration::from_secs(5);
    settings
}

fn session_config() -> SessionConfig {
    SessionConfig::new(magic(), 70_013, "/headerd:test/".to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_download_then_follows_announcements() {
    let engine = memory_engine(Arc::new(NoopListener));
    let shared = SyncShared::default();
    let sync = SyncOrchestrator::start(
        Arc::clone(&engine),
        settings(),
        session_config(),
        shared.clone(),
    );
    assert_eq!(sync.mode(), SyncMode::InitialDownload);

    let chain = mine_chain(2500);
    let (local, remote) = tokio::io::duplex(1 << 16);
    let peer = FakePeer::spawn(remote, chain.clone(), 2500);
    sync.attach_peer(local, peer_addr());

    let mut mode = sync.subscribe_mode();
    tokio::time::timeout(WAIT, mode.wait_for(|mode| *mode == SyncMode::Following))
        .await
        .expect("left initial download")
        .expect("mode channel");

    let tip = engine.tip_of_longest().expect("tip");
    assert_eq!(tip.height, 2500);
    assert_eq!(tip.hash, chain[2500].hash());

    // Two batches: 2000 then 500, the second requested from the uncommitted
    // download tip.
    let requests = peer.requests.lock().expect("requests").clone();
    assert!(requests.len() >= 2);
    assert_eq!(requests[1][0], chain[2000].hash());

    let metrics = shared.metrics.snapshot();
    assert_eq!(metrics.headers_committed, 2500);
    assert_eq!(metrics.rejected_batches, 0);

    let next = mine(&chain[2500], 9_999);
    peer.announce(&[next]).await;
    assert!(
        eventually(WAIT, || engine
            .tip_of_longest()
            .map(|tip| tip.hash == next.hash())
            .unwrap_or(false))
        .await
    );
    assert!(shared.peer_book.preferred(8).contains(&peer_addr()));

    sync.shutdown().await;
    assert!(eventually(WAIT, || shared.registry.count() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_header_bans_peer_and_aborts_batch() {
    let engine = memory_engine(Arc::new(NoopListener));
    let shared = SyncShared::default();
    let sync = SyncOrchestrator::start(
        Arc::clone(&engine),
        settings(),
        session_config(),
        shared.clone(),
    );

    let mut chain = mine_chain(4);
    let mut bad = mine(&chain[4], 4);
    while headerd_pow::proof_of_work_valid(&bad) {
        bad.nonce += 1;
    }
    chain.push(bad);
    for tag in 5..9 {
        let next = mine(&chain[chain.len() - 1], tag);
        chain.push(next);
    }

    let (local, remote) = tokio::io::duplex(1 << 16);
    let _peer = FakePeer::spawn(remote, chain, 9);
    sync.attach_peer(local, peer_addr());

    assert!(eventually(WAIT, || shared.peer_book.is_banned(peer_addr())).await);
    assert!(eventually(WAIT, || shared.registry.count() == 0).await);
    assert_eq!(engine.tip_of_longest().expect("tip").height, 0);
    assert_eq!(engine.count().expect("count"), 1);
    assert_eq!(shared.metrics.snapshot().rejected_batches, 1);
    assert_eq!(sync.mode(), SyncMode::InitialDownload);

    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_without_headers_ends_download_at_its_height() {
    let engine = memory_engine(Arc::new(NoopListener));
    let shared = SyncShared::default();
    let sync = SyncOrchestrator::start(
        Arc::clone(&engine),
        settings(),
        session_config(),
        shared.clone(),
    );

    let (local, remote) = tokio::io::duplex(1 << 16);
    let _peer = FakePeer::spawn(remote, mine_chain(0), 0);
    sync.attach_peer(local, peer_addr());

    let mut mode = sync.subscribe_mode();
    tokio::time::timeout(WAIT, mode.wait_for(|mode| *mode == SyncMode::Following))
        .await
        .expect("left initial download")
        .expect("mode channel");
    assert_eq!(engine.tip_of_longest().expect("tip").height, 0);

    sync.shutdown().await;
    assert!(eventually(WAIT, || shared.registry.count() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_pause_while_commit_queue_is_full() {
    let gate = Arc::new(CommitGate::default());
    let engine = memory_engine(gate.clone());
    let shared = SyncShared::default();
    let mut settings = settings();
    settings.commit_queue_limit = 1;
    let sync = SyncOrchestrator::start(
        Arc::clone(&engine),
        settings,
        session_config(),
        shared.clone(),
    );

    let chain = mine_chain(4500);
    let (local, remote) = tokio::io::duplex(1 << 16);
    let peer = FakePeer::spawn(remote, chain.clone(), 4500);
    sync.attach_peer(local, peer_addr());

    // First batch is received and queued, but its commit is held.
    assert!(eventually(WAIT, || shared.metrics.queue_depth() == 1).await);
    assert_eq!(shared.metrics.snapshot().headers_received, 2000);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(peer.requests.lock().expect("requests").len(), 1);
    assert_eq!(shared.metrics.snapshot().headers_committed, 0);

    gate.open();
    let mut mode = sync.subscribe_mode();
    tokio::time::timeout(WAIT, mode.wait_for(|mode| *mode == SyncMode::Following))
        .await
        .expect("left initial download")
        .expect("mode channel");

    let requests = peer.requests.lock().expect("requests").clone();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1][0], chain[2000].hash());
    assert_eq!(requests[2][0], chain[4000].hash());
    assert_eq!(engine.tip_of_longest().expect("tip").height, 4500);
    assert_eq!(shared.metrics.snapshot().headers_committed, 4500);

    sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_queued_behind_a_rejected_batch_are_dropped() {
    let gate = Arc::new(CommitGate::default());
    let engine = memory_engine(gate.clone());
    let shared = SyncShared::default();
    let sync = SyncOrchestrator::start(
        Arc::clone(&engine),
        settings(),
        session_config(),
        shared.clone(),
    );

    // Heights 1..=2499 valid, 2500 fails proof of work, 2501..=5000 build on it.
    let mut chain = mine_chain(2499);
    let mut bad = mine(&chain[2499], 2499);
    while headerd_pow::proof_of_work_valid(&bad) {
        bad.nonce += 1;
    }
    chain.push(bad);
    for tag in 2500..5000 {
        let next = mine(&chain[chain.len() - 1], tag);
        chain.push(next);
    }

    let (local, remote) = tokio::io::duplex(1 << 16);
    let peer = FakePeer::spawn(remote, chain.clone(), 5000);
    sync.attach_peer(local, peer_addr());

    // Three batches pipelined while the first commit is held.
    assert!(eventually(WAIT, || shared.metrics.queue_depth() == 3).await);
    assert_eq!(peer.requests.lock().expect("requests").len(), 3);

    gate.open();
    assert!(eventually(WAIT, || shared.peer_book.is_banned(peer_addr())).await);
    assert!(eventually(WAIT, || shared.metrics.queue_depth() == 0).await);

    let tip = engine.tip_of_longest().expect("tip");
    assert_eq!(tip.hash, chain[2000].hash());
    assert_eq!(engine.count().expect("count"), 2001);
    let metrics = shared.metrics.snapshot();
    assert_eq!(metrics.headers_committed, 2000);
    assert_eq!(metrics.rejected_batches, 1);
    assert_eq!(metrics.orphans, 0);
    assert_eq!(sync.mode(), SyncMode::InitialDownload);

    sync.shutdown().await;
}
