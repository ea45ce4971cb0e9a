//! Header download: picks a sync peer, pipelines `getheaders` requests ahead
//! of the commit worker and switches to following announcements once the
//! initial download has caught up.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use headerd_chainstate::{AddOutcome, ChainEngine, ChainError, Placement};
use headerd_consensus::constants::{MAX_HEADERS_RESULTS, MAX_LOCATOR_SZ};
use headerd_consensus::{hash256_to_hex, Hash256, ZERO_HASH};
use headerd_primitives::BlockHeader;
use headerd_storage::{KeyValueStore, StoreError};
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::p2p::{NetTotals, PeerId, PeerRegistry};
use crate::peer_book::PeerBook;
use crate::session::{
    spawn_session, KnownHeaders, PeerEvent, PeerHandle, SessionConfig, SessionContext, SessionError,
};
use crate::stats::SyncMetrics;

const PEER_EVENT_QUEUE: usize = 256;
const COMMIT_QUEUE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    InitialDownload,
    Following,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::InitialDownload => "SYNCING_IBD",
            SyncMode::Following => "FOLLOWING",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub seed_peers: Vec<String>,
    pub default_port: u16,
    pub max_peers: usize,
    pub tick: Duration,
    pub connect_timeout: Duration,
    /// Queued batches at which new requests pause.
    pub commit_queue_limit: usize,
    pub shutdown_grace: Duration,
    pub ibd_height_drift: i32,
}

impl SyncSettings {
    pub fn new(seed_peers: Vec<String>, default_port: u16, max_peers: usize, ibd_height_drift: i32) -> Self {
        Self {
            seed_peers,
            default_port,
            max_peers,
            tick: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            commit_queue_limit: 8,
            shutdown_grace: Duration::from_secs(10),
            ibd_height_drift,
        }
    }
}

/// Handles shared with the HTTP status view.
#[derive(Clone, Default)]
pub struct SyncShared {
    pub registry: Arc<PeerRegistry>,
    pub net_totals: Arc<NetTotals>,
    pub peer_book: Arc<PeerBook>,
    pub metrics: Arc<SyncMetrics>,
}

pub struct SyncHandle {
    mode: watch::Receiver<SyncMode>,
    shutdown: watch::Sender<bool>,
    session_ctx: SessionContext,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    pub fn mode(&self) -> SyncMode {
        *self.mode.borrow()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<SyncMode> {
        self.mode.clone()
    }

    /// Starts a session over an already-connected stream.
    pub fn attach_peer<T>(&self, stream: T, addr: SocketAddr) -> PeerHandle
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        spawn_session(stream, addr, self.session_ctx.clone())
    }

    /// Stops new requests, lets queued batches commit within the grace
    /// period, then closes every session.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                log_warn!("sync task ended abnormally: {err}");
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BatchSource {
    /// Initial download; `short` carries the peer's advertised height when
    /// the batch was below the maximum size.
    Download { short: Option<i32> },
    Announcement,
    GapFill,
}

struct CommitJob {
    peer: PeerId,
    addr: SocketAddr,
    headers: Vec<BlockHeader>,
    source: BatchSource,
    epoch: u64,
}

struct CommitReport {
    peer: PeerId,
    addr: SocketAddr,
    count: usize,
    source: BatchSource,
    elapsed: Duration,
    /// `None` when the batch was dropped as stale.
    result: Option<Result<Vec<AddOutcome>, ChainError>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    Download,
    GapFill,
}

enum Internal {
    Response {
        peer: PeerId,
        addr: SocketAddr,
        kind: RequestKind,
        elapsed: Duration,
        result: Result<Vec<BlockHeader>, SessionError>,
    },
    Committed(CommitReport),
    Dialed {
        addr: SocketAddr,
        connected: bool,
    },
}

pub struct SyncOrchestrator<S> {
    engine: Arc<ChainEngine<S>>,
    settings: SyncSettings,
    shared: SyncShared,
    session_ctx: SessionContext,
    peer_events: mpsc::Receiver<PeerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    commit_tx: Option<mpsc::Sender<CommitJob>>,
    epoch: Arc<AtomicU64>,
    mode_tx: watch::Sender<SyncMode>,
    sync_peer: Option<PeerId>,
    download_in_flight: bool,
    /// A short download batch is queued; its commit decides what comes next.
    awaiting_final_commit: bool,
    gap_in_flight: HashSet<PeerId>,
    exhausted: HashSet<PeerId>,
    download_tip: Option<Hash256>,
    queued: usize,
    dialing: HashSet<SocketAddr>,
    resolved_seeds: Vec<SocketAddr>,
    stopping: bool,
}

impl<S: KeyValueStore + 'static> SyncOrchestrator<S> {
    /// Spawns the orchestrator and its commit worker.
    pub fn start(
        engine: Arc<ChainEngine<S>>,
        settings: SyncSettings,
        session_config: SessionConfig,
        shared: SyncShared,
    ) -> SyncHandle {
        let (events_tx, peer_events) = mpsc::channel(PEER_EVENT_QUEUE);
        let session_ctx = SessionContext {
            config: Arc::new(session_config),
            known: Arc::clone(&engine) as Arc<dyn KnownHeaders>,
            registry: Arc::clone(&shared.registry),
            totals: Arc::clone(&shared.net_totals),
            events: events_tx,
        };
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_QUEUE);
        let epoch = Arc::new(AtomicU64::new(0));
        let (mode_tx, mode_rx) = watch::channel(SyncMode::InitialDownload);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(commit_worker(
            Arc::clone(&engine),
            commit_rx,
            Arc::clone(&epoch),
            internal_tx.clone(),
        ));

        let orchestrator = SyncOrchestrator {
            engine,
            settings,
            shared,
            session_ctx: session_ctx.clone(),
            peer_events,
            internal_tx,
            internal_rx,
            commit_tx: Some(commit_tx),
            epoch,
            mode_tx,
            sync_peer: None,
            download_in_flight: false,
            awaiting_final_commit: false,
            gap_in_flight: HashSet::new(),
            exhausted: HashSet::new(),
            download_tip: None,
            queued: 0,
            dialing: HashSet::new(),
            resolved_seeds: Vec::new(),
            stopping: false,
        };
        let task = tokio::spawn(orchestrator.run(shutdown_rx));

        SyncHandle {
            mode: mode_rx,
            shutdown: shutdown_tx,
            session_ctx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log_info!(
            "sync started (max peers {}, {} seed(s))",
            self.settings.max_peers,
            self.settings.seed_peers.len()
        );
        self.resolve_seeds().await;
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = self.peer_events.recv() => self.on_peer_event(event),
                Some(message) = self.internal_rx.recv() => self.on_internal(message).await,
                _ = ticker.tick() => self.on_tick().await,
            }
            self.maybe_request();
        }
        self.drain().await;
    }

    fn mode(&self) -> SyncMode {
        *self.mode_tx.borrow()
    }

    fn set_mode(&self, mode: SyncMode) {
        if self.mode() != mode {
            log_info!("sync mode {} -> {}", self.mode().as_str(), mode.as_str());
            self.mode_tx.send_replace(mode);
        }
    }

    fn tip_height(&self) -> i32 {
        self.engine
            .tip_of_longest()
            .map(|tip| tip.height)
            .unwrap_or(0)
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Ready {
                peer,
                addr,
                version,
            } => {
                log_debug!("peer {peer} ({addr}) ready at height {}", version.start_height);
                if self.mode() == SyncMode::Following && version.start_height > self.tip_height() {
                    self.request_gap(peer, None);
                }
            }
            PeerEvent::Announced { peer, headers } => self.on_announced(peer, headers),
            PeerEvent::Closed {
                peer,
                addr,
                reason,
                banned,
            } => {
                if banned {
                    self.shared.peer_book.ban(addr, &reason);
                } else if !self.stopping && reason != "shutdown" {
                    self.shared.peer_book.record_failure(addr);
                }
                if self.sync_peer == Some(peer) {
                    self.sync_peer = None;
                }
                self.gap_in_flight.remove(&peer);
                self.exhausted.remove(&peer);
            }
        }
    }

    fn on_announced(&mut self, peer: PeerId, headers: Vec<BlockHeader>) {
        let Some(first) = headers.first() else {
            return;
        };
        self.shared.metrics.record_received(headers.len() as u64);
        let connects = self.engine.exists(&first.prev_block).unwrap_or(false)
            || self.download_tip == Some(first.prev_block);
        if connects {
            let addr = match self.shared.registry.handle(peer) {
                Some(handle) => handle.addr(),
                None => return,
            };
            self.submit(peer, addr, headers, BatchSource::Announcement);
        } else if self.mode() == SyncMode::Following {
            log_debug!(
                "announcement from peer {peer} does not connect at {}; requesting gap",
                hash256_to_hex(&first.prev_block)
            );
            self.request_gap(peer, None);
        }
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Response {
                peer,
                addr,
                kind,
                elapsed,
                result,
            } => self.on_response(peer, addr, kind, elapsed, result),
            Internal::Committed(report) => self.on_committed(report).await,
            Internal::Dialed { addr, connected } => {
                self.dialing.remove(&addr);
                if !connected {
                    self.shared.peer_book.record_failure(addr);
                }
            }
        }
    }

    fn on_response(
        &mut self,
        peer: PeerId,
        addr: SocketAddr,
        kind: RequestKind,
        elapsed: Duration,
        result: Result<Vec<BlockHeader>, SessionError>,
    ) {
        match kind {
            RequestKind::Download => self.download_in_flight = false,
            RequestKind::GapFill => {
                self.gap_in_flight.remove(&peer);
            }
        }
        let headers = match result {
            Ok(headers) => headers,
            Err(err) => {
                log_debug!("header request to {addr} failed: {err}");
                if kind == RequestKind::Download && self.sync_peer == Some(peer) {
                    self.sync_peer = None;
                }
                return;
            }
        };
        self.shared
            .metrics
            .record_request(headers.len() as u64, elapsed);
        let full = headers.len() >= MAX_HEADERS_RESULTS;

        match kind {
            RequestKind::Download => {
                let peer_height = self.shared.registry.start_height(peer).unwrap_or(0);
                if headers.is_empty() {
                    self.finish_download_from(peer, peer_height);
                    return;
                }
                let last = headers[headers.len() - 1].hash();
                self.download_tip = Some(last);
                let short = (!full).then_some(peer_height);
                self.awaiting_final_commit = short.is_some();
                self.submit(peer, addr, headers, BatchSource::Download { short });
            }
            RequestKind::GapFill => {
                if headers.is_empty() {
                    return;
                }
                let last = headers[headers.len() - 1].hash();
                self.submit(peer, addr, headers, BatchSource::GapFill);
                if full {
                    self.request_gap(peer, Some(last));
                }
            }
        }
    }

    /// The sync peer has nothing more for us. Leave IBD if we reached its
    /// advertised height, otherwise try another peer.
    fn finish_download_from(&mut self, peer: PeerId, peer_height: i32) {
        if self.mode() != SyncMode::InitialDownload {
            return;
        }
        let tip = self.tip_height();
        if tip >= peer_height - self.settings.ibd_height_drift {
            log_info!("initial header download complete at height {tip}");
            self.sync_peer = None;
            self.set_mode(SyncMode::Following);
            return;
        }
        log_warn!(
            "peer {peer} stopped at height {tip}, below its advertised {peer_height}; switching peer"
        );
        self.exhausted.insert(peer);
        if self.sync_peer == Some(peer) {
            self.sync_peer = None;
        }
        let others = self
            .shared
            .registry
            .sync_candidates()
            .iter()
            .any(|(handle, _)| !self.exhausted.contains(&handle.id()));
        if !others {
            log_warn!("no peer can extend the chain further; following at height {tip}");
            self.set_mode(SyncMode::Following);
        }
    }

    async fn on_committed(&mut self, report: CommitReport) {
        self.queued = self.queued.saturating_sub(1);
        self.shared.metrics.set_queue_depth(self.queued);
        if matches!(report.source, BatchSource::Download { short: Some(_) }) {
            self.awaiting_final_commit = false;
        }
        let Some(result) = report.result else {
            log_debug!("dropped stale batch of {} from {}", report.count, report.addr);
            return;
        };
        match result {
            Ok(outcomes) => {
                let mut reorgs = 0u64;
                let mut orphans = 0u64;
                for outcome in &outcomes {
                    match outcome.placement {
                        Placement::Reorganized { .. } => reorgs += 1,
                        Placement::Orphan => orphans += 1,
                        _ => {}
                    }
                }
                self.shared
                    .metrics
                    .record_commit(report.count as u64, report.elapsed);
                self.shared.metrics.record_placements(reorgs, orphans);
                self.shared.peer_book.record_success(report.addr);
                log_debug!(
                    "committed {} header(s) from {} in {}ms (tip {})",
                    report.count,
                    report.addr,
                    report.elapsed.as_millis(),
                    self.tip_height()
                );
                if let BatchSource::Download {
                    short: Some(peer_height),
                } = report.source
                {
                    self.finish_download_from(report.peer, peer_height);
                }
            }
            Err(err) => {
                self.shared.metrics.record_rejected();
                self.reset_download();
                if let ChainError::InvalidHeader {
                    index,
                    hash,
                    reason,
                } = &err
                {
                    let reason = format!(
                        "invalid header {} at index {index}: {reason}",
                        hash256_to_hex(hash)
                    );
                    log_warn!("banning {}: {reason}", report.addr);
                    self.shared.peer_book.ban(report.addr, &reason);
                    if let Some(handle) = self.shared.registry.handle(report.peer) {
                        handle.ban(reason).await;
                    }
                } else {
                    log_error!("failed to commit batch from {}: {err}", report.addr);
                }
            }
        }
    }

    /// Forget uncommitted progress; queued batches built on it are dropped.
    fn reset_download(&mut self) {
        self.download_tip = None;
        self.sync_peer = None;
        self.awaiting_final_commit = false;
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    fn submit(&mut self, peer: PeerId, addr: SocketAddr, headers: Vec<BlockHeader>, source: BatchSource) {
        let Some(commit_tx) = &self.commit_tx else {
            return;
        };
        let job = CommitJob {
            peer,
            addr,
            headers,
            source,
            epoch: self.epoch.load(Ordering::Relaxed),
        };
        match commit_tx.try_send(job) {
            Ok(()) => {
                self.queued += 1;
                self.shared.metrics.set_queue_depth(self.queued);
            }
            Err(_) => {
                log_warn!("commit queue full; dropping batch from {addr}");
                self.reset_download();
            }
        }
    }

    fn locator_from(&self, head: Option<Hash256>) -> Result<Vec<Hash256>, ChainError> {
        let mut locator = self.engine.block_locator()?;
        if let Some(head) = head {
            if locator.first() != Some(&head) {
                locator.insert(0, head);
            }
        }
        while locator.len() > MAX_LOCATOR_SZ {
            // Keep genesis as the final entry.
            locator.remove(locator.len() - 2);
        }
        Ok(locator)
    }

    fn maybe_request(&mut self) {
        if self.stopping
            || self.download_in_flight
            || self.awaiting_final_commit
            || self.mode() != SyncMode::InitialDownload
        {
            return;
        }
        if self.queued >= self.settings.commit_queue_limit {
            log_trace!("commit queue at {}; pausing requests", self.queued);
            return;
        }

        let handle = match self.sync_peer.and_then(|id| self.shared.registry.handle(id)) {
            Some(handle) => handle,
            None => {
                let candidate = self
                    .shared
                    .registry
                    .sync_candidates()
                    .into_iter()
                    .find(|(handle, _)| {
                        !self.exhausted.contains(&handle.id())
                            && !self.shared.peer_book.is_banned(handle.addr())
                    });
                let Some((handle, height)) = candidate else {
                    return;
                };
                log_info!(
                    "selected sync peer {} ({}) at height {height}",
                    handle.id(),
                    handle.addr()
                );
                self.sync_peer = Some(handle.id());
                handle
            }
        };

        let locator = match self.locator_from(self.download_tip) {
            Ok(locator) => locator,
            Err(err) => {
                log_error!("failed to build block locator: {err}");
                return;
            }
        };
        self.download_in_flight = true;
        self.spawn_request(handle, locator, RequestKind::Download);
    }

    fn request_gap(&mut self, peer: PeerId, head: Option<Hash256>) {
        if self.stopping || self.gap_in_flight.contains(&peer) {
            return;
        }
        let Some(handle) = self.shared.registry.handle(peer) else {
            return;
        };
        let locator = match self.locator_from(head) {
            Ok(locator) => locator,
            Err(err) => {
                log_error!("failed to build block locator: {err}");
                return;
            }
        };
        self.gap_in_flight.insert(peer);
        self.spawn_request(handle, locator, RequestKind::GapFill);
    }

    fn spawn_request(&self, handle: PeerHandle, locator: Vec<Hash256>, kind: RequestKind) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = handle.request_headers(locator, ZERO_HASH).await;
            let _ = internal.send(Internal::Response {
                peer: handle.id(),
                addr: handle.addr(),
                kind,
                elapsed: started.elapsed(),
                result,
            });
        });
    }

    async fn resolve_seeds(&mut self) {
        let mut resolved = Vec::new();
        for seed in &self.settings.seed_peers {
            let target = if seed.contains(':') {
                seed.clone()
            } else {
                format!("{seed}:{}", self.settings.default_port)
            };
            let lookup = tokio::net::lookup_host(target.as_str()).await;
            match lookup {
                Ok(addrs) => resolved.extend(addrs),
                Err(err) => log_warn!("failed to resolve seed {target}: {err}"),
            }
        }
        resolved.sort();
        resolved.dedup();
        resolved.shuffle(&mut rand::thread_rng());
        self.resolved_seeds = resolved;
    }

    async fn on_tick(&mut self) {
        if self.stopping {
            return;
        }
        let connected = self.shared.registry.count() + self.dialing.len();
        if connected >= self.settings.max_peers {
            return;
        }
        if self.resolved_seeds.is_empty() && !self.settings.seed_peers.is_empty() {
            self.resolve_seeds().await;
        }
        let want = self.settings.max_peers - connected;
        let mut candidates = self.shared.peer_book.preferred(self.settings.max_peers);
        candidates.extend(self.resolved_seeds.iter().copied());
        let mut picked = Vec::new();
        for addr in candidates {
            if picked.len() >= want {
                break;
            }
            if picked.contains(&addr)
                || self.dialing.contains(&addr)
                || self.shared.peer_book.is_banned(addr)
                || self.shared.registry.is_connected(&addr)
            {
                continue;
            }
            picked.push(addr);
        }
        for addr in picked {
            self.dial(addr);
        }
    }

    fn dial(&mut self, addr: SocketAddr) {
        self.dialing.insert(addr);
        let ctx = self.session_ctx.clone();
        let internal = self.internal_tx.clone();
        let connect_timeout = self.settings.connect_timeout;
        tokio::spawn(async move {
            let connected =
                match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => {
                        let _ = stream.set_nodelay(true);
                        spawn_session(stream, addr, ctx);
                        true
                    }
                    Ok(Err(err)) => {
                        log_debug!("connect to {addr} failed: {err}");
                        false
                    }
                    Err(_) => {
                        log_debug!("connect to {addr} timed out");
                        false
                    }
                };
            let _ = internal.send(Internal::Dialed { addr, connected });
        });
    }

    async fn drain(&mut self) {
        self.stopping = true;
        self.commit_tx = None;
        let deadline = tokio::time::Instant::now() + self.settings.shutdown_grace;
        while self.queued > 0 {
            match tokio::time::timeout_at(deadline, self.internal_rx.recv()).await {
                Ok(Some(Internal::Committed(report))) => self.on_committed(report).await,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if self.queued > 0 {
            log_warn!("shutdown grace elapsed with {} batch(es) uncommitted", self.queued);
        }
        for handle in self.shared.registry.handles() {
            handle.shutdown().await;
        }
        log_info!("sync stopped at height {}", self.tip_height());
    }
}

async fn commit_worker<S: KeyValueStore + 'static>(
    engine: Arc<ChainEngine<S>>,
    mut jobs: mpsc::Receiver<CommitJob>,
    epoch: Arc<AtomicU64>,
    reports: mpsc::UnboundedSender<Internal>,
) {
    while let Some(job) = jobs.recv().await {
        let count = job.headers.len();
        let started = Instant::now();
        let result = if job.epoch != epoch.load(Ordering::Relaxed) {
            None
        } else {
            let engine = Arc::clone(&engine);
            let headers = job.headers;
            let result = tokio::task::spawn_blocking(move || engine.add_headers(&headers))
                .await
                .unwrap_or_else(|err| {
                    Err(ChainError::Storage(StoreError::Backend(format!(
                        "commit task failed: {err}"
                    ))))
                });
            if result.is_err() {
                // Jobs already queued behind a rejected batch are stale.
                epoch.fetch_add(1, Ordering::Relaxed);
            }
            Some(result)
        };
        let report = CommitReport {
            peer: job.peer,
            addr: job.addr,
            count,
            source: job.source,
            elapsed: started.elapsed(),
            result,
        };
        if reports.send(Internal::Committed(report)).is_err() {
            break;
        }
    }
}
