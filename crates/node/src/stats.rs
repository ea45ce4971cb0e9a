use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use headerd_chainstate::ChainEngine;
use headerd_consensus::{hash256_to_hex, Network};
use headerd_storage::KeyValueStore;
use serde::Serialize;

use crate::p2p::{NetTotals, NetTotalsSnapshot, PeerInfoSnapshot, PeerRegistry};
use crate::peer_book::{BannedPeer, PeerBook};
use crate::sync::SyncMode;

/// Counters shared by the orchestrator and its commit worker.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    header_request_us: AtomicU64,
    header_requests: AtomicU64,
    headers_received: AtomicU64,
    commit_us: AtomicU64,
    commit_batches: AtomicU64,
    headers_committed: AtomicU64,
    rejected_batches: AtomicU64,
    reorgs: AtomicU64,
    orphans: AtomicU64,
    queue_depth: AtomicU64,
}

impl SyncMetrics {
    pub fn record_request(&self, headers: u64, elapsed: Duration) {
        self.header_request_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.header_requests.fetch_add(1, Ordering::Relaxed);
        self.headers_received.fetch_add(headers, Ordering::Relaxed);
    }

    pub fn record_received(&self, headers: u64) {
        self.headers_received.fetch_add(headers, Ordering::Relaxed);
    }

    pub fn record_commit(&self, headers: u64, elapsed: Duration) {
        self.commit_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.commit_batches.fetch_add(1, Ordering::Relaxed);
        self.headers_committed.fetch_add(headers, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_placements(&self, reorgs: u64, orphans: u64) {
        self.reorgs.fetch_add(reorgs, Ordering::Relaxed);
        self.orphans.fetch_add(orphans, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed) as usize
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            header_request_us: self.header_request_us.load(Ordering::Relaxed),
            header_requests: self.header_requests.load(Ordering::Relaxed),
            headers_received: self.headers_received.load(Ordering::Relaxed),
            commit_us: self.commit_us.load(Ordering::Relaxed),
            commit_batches: self.commit_batches.load(Ordering::Relaxed),
            headers_committed: self.headers_committed.load(Ordering::Relaxed),
            rejected_batches: self.rejected_batches.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetricsSnapshot {
    pub header_request_us: u64,
    pub header_requests: u64,
    pub headers_received: u64,
    pub commit_us: u64,
    pub commit_batches: u64,
    pub headers_committed: u64,
    pub rejected_batches: u64,
    pub reorgs: u64,
    pub orphans: u64,
    pub queue_depth: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub network: String,
    pub version: &'static str,
    pub sync_mode: &'static str,
    pub tip_hash: String,
    pub tip_height: i32,
    pub header_count: u64,
    pub uptime_secs: u64,
    pub unix_time_secs: u64,
    pub peers: Vec<PeerInfoSnapshot>,
    pub banned: Vec<BannedPeer>,
    pub net: NetTotalsSnapshot,
    pub metrics: SyncMetricsSnapshot,
}

/// Read-only handles the `/status` view is assembled from.
pub struct StatusSources<'a, S> {
    pub engine: &'a ChainEngine<S>,
    pub network: Network,
    pub started: Instant,
    pub sync_mode: SyncMode,
    pub registry: &'a PeerRegistry,
    pub peer_book: &'a PeerBook,
    pub net_totals: &'a NetTotals,
    pub metrics: &'a SyncMetrics,
}

pub fn snapshot_status<S: KeyValueStore>(
    sources: &StatusSources<'_, S>,
) -> Result<StatusSnapshot, String> {
    let tip = sources
        .engine
        .tip_of_longest()
        .map_err(|err| err.to_string())?;
    let header_count = sources.engine.count().map_err(|err| err.to_string())?;
    let unix_time_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    Ok(StatusSnapshot {
        network: sources.network.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        sync_mode: sources.sync_mode.as_str(),
        tip_hash: hash256_to_hex(&tip.hash),
        tip_height: tip.height,
        header_count,
        uptime_secs: sources.started.elapsed().as_secs(),
        unix_time_secs,
        peers: sources.registry.snapshot(),
        banned: sources.peer_book.banned_peers(),
        net: sources.net_totals.snapshot(),
        metrics: sources.metrics.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = SyncMetrics::default();
        metrics.record_request(2000, Duration::from_millis(5));
        metrics.record_request(10, Duration::from_millis(1));
        metrics.record_received(1);
        metrics.record_commit(2010, Duration::from_micros(700));
        metrics.record_placements(1, 3);
        metrics.record_rejected();
        metrics.set_queue_depth(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.header_requests, 2);
        assert_eq!(snapshot.headers_received, 2011);
        assert_eq!(snapshot.header_request_us, 6000);
        assert_eq!(snapshot.commit_batches, 1);
        assert_eq!(snapshot.headers_committed, 2010);
        assert_eq!(snapshot.commit_us, 700);
        assert_eq!(snapshot.reorgs, 1);
        assert_eq!(snapshot.orphans, 3);
        assert_eq!(snapshot.rejected_batches, 1);
        assert_eq!(metrics.queue_depth(), 4);

        let json = serde_json::to_value(&snapshot).expect("json");
        assert_eq!(json["headersCommitted"], 2010);
    }
}
