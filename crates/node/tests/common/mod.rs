#![allow(dead_code)]

use std::sync::{Arc, Condvar};
use std::time::Duration;

use headerd::p2p::{
    build_headers_payload, build_version_payload, parse_getheaders, read_frame, write_frame,
    VersionMessage,
};
use headerd_chainstate::{ChainEngine, ChainEvent, ChainListener, ChainStore, Clock};
use headerd_consensus::constants::{MAX_HEADERS_RESULTS, NODE_NETWORK};
use headerd_consensus::{chain_params, ChainParams, Network};
use headerd_pow::proof_of_work_valid;
use headerd_primitives::{sha256, BlockHeader};
use headerd_storage::memory::MemoryStore;
use tokio::io::{DuplexStream, WriteHalf};
use tokio::sync::Mutex;

pub fn regtest() -> ChainParams {
    chain_params(Network::Regtest)
}

pub fn magic() -> [u8; 4] {
    regtest().message_start
}

pub fn genesis() -> BlockHeader {
    BlockHeader::genesis(&regtest().genesis)
}

pub fn test_clock() -> Clock {
    let now = genesis().time as i64 + 365 * 24 * 60 * 60;
    Arc::new(move || now)
}

pub fn memory_engine(listener: Arc<dyn ChainListener>) -> Arc<ChainEngine<MemoryStore>> {
    let params = regtest();
    let chain = ChainStore::open(Arc::new(MemoryStore::new()), &params).expect("open chain store");
    Arc::new(ChainEngine::with_clock(chain, params, listener, test_clock()))
}

pub fn mine(parent: &BlockHeader, tag: u32) -> BlockHeader {
    let mut header = BlockHeader {
        version: 4,
        prev_block: parent.hash(),
        merkle_root: sha256(&tag.to_le_bytes()),
        time: parent.time + 600,
        bits: 0x207f_ffff,
        nonce: 0,
    };
    while !proof_of_work_valid(&header) {
        header.nonce += 1;
    }
    header
}

/// Genesis followed by `len` mined headers.
pub fn mine_chain(len: usize) -> Vec<BlockHeader> {
    let mut chain = vec![genesis()];
    for tag in 0..len {
        let next = mine(&chain[chain.len() - 1], tag as u32);
        chain.push(next);
    }
    chain
}

/// Listener that holds every commit at its first event until opened, so
/// batches pile up in the commit queue. Gives up after 30 s.
#[derive(Default)]
pub struct CommitGate {
    open: std::sync::Mutex<bool>,
    opened: Condvar,
}

impl CommitGate {
    pub fn open(&self) {
        *self.open.lock().expect("gate") = true;
        self.opened.notify_all();
    }
}

impl ChainListener for CommitGate {
    fn on_chain_event(&self, _event: &ChainEvent) {
        let mut open = self.open.lock().expect("gate");
        while !*open {
            let (guard, wait) = self
                .opened
                .wait_timeout(open, Duration::from_secs(30))
                .expect("gate");
            open = guard;
            if wait.timed_out() {
                break;
            }
        }
    }
}

/// Polls `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A scripted remote node serving `chain` over one end of a duplex pipe.
pub struct FakePeer {
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    pub requests: Arc<std::sync::Mutex<Vec<Vec<[u8; 32]>>>>,
}

impl FakePeer {
    pub fn spawn(stream: DuplexStream, chain: Vec<BlockHeader>, start_height: i32) -> Self {
        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let requests = Arc::new(std::sync::Mutex::new(Vec::new()));
        let peer = FakePeer {
            writer: Arc::clone(&writer),
            requests: Arc::clone(&requests),
        };
        tokio::spawn(async move {
            let magic = magic();
            while let Ok(frame) = read_frame(&mut reader, magic).await {
                let mut out = writer.lock().await;
                let sent = match frame.command.as_str() {
                    "version" => {
                        let mut version = VersionMessage::ours("/fake:1.0/", start_height);
                        version.services = NODE_NETWORK;
                        let payload = build_version_payload(&version);
                        match write_frame(&mut *out, magic, "version", &payload).await {
                            Ok(_) => write_frame(&mut *out, magic, "verack", &[]).await,
                            Err(err) => Err(err),
                        }
                    }
                    "ping" => write_frame(&mut *out, magic, "pong", &frame.payload).await,
                    "getheaders" => {
                        let request = parse_getheaders(&frame.payload).expect("getheaders");
                        requests.lock().expect("requests").push(request.locator.clone());
                        let start = request
                            .locator
                            .iter()
                            .find_map(|hash| chain.iter().position(|h| h.hash() == *hash))
                            .map(|index| index + 1)
                            .unwrap_or(1);
                        let end = chain.len().min(start + MAX_HEADERS_RESULTS);
                        let slice = if start < end { &chain[start..end] } else { &[][..] };
                        let payload = build_headers_payload(slice);
                        write_frame(&mut *out, magic, "headers", &payload).await
                    }
                    _ => Ok(0),
                };
                if sent.is_err() {
                    break;
                }
            }
        });
        peer
    }

    /// Pushes unsolicited headers.
    pub async fn announce(&self, headers: &[BlockHeader]) {
        let mut out = self.writer.lock().await;
        write_frame(&mut *out, magic(), "headers", &build_headers_payload(headers))
            .await
            .expect("announce");
    }
}
