use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use headerd_consensus::constants::{
    MAX_HEADERS_RESULTS, MAX_LOCATOR_SZ, MAX_PROTOCOL_MESSAGE_LENGTH, NODE_NETWORK,
    PROTOCOL_VERSION,
};
use headerd_consensus::Hash256;
use headerd_primitives::hash::checksum;
use headerd_primitives::{BlockHeader, Decoder, Encoder};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::{PeerHandle, PeerState};

pub const FRAME_HEADER_LEN: usize = 24;
const COMMAND_LEN: usize = 12;

pub type PeerId = u64;

#[derive(Debug)]
pub enum FrameError {
    Io(std::io::Error),
    BadMagic([u8; 4]),
    BadChecksum,
    BadCommand,
    TooLarge(usize),
}

impl FrameError {
    /// Errors caused by the bytes the peer sent rather than the transport.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(err) => write!(f, "{err}"),
            FrameError::BadMagic(magic) => write!(f, "invalid magic {}", hex_bytes(magic)),
            FrameError::BadChecksum => f.write_str("invalid payload checksum"),
            FrameError::BadCommand => f.write_str("invalid command name"),
            FrameError::TooLarge(len) => write!(f, "payload too large ({len} bytes)"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}

pub fn encode_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let cmd = command.as_bytes();
    if cmd.is_empty() || cmd.len() > COMMAND_LEN || !cmd.iter().all(u8::is_ascii_graphic) {
        return Err(FrameError::BadCommand);
    }
    if payload.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_LEN];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    out.extend_from_slice(&command_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    Ok(out)
}

/// Writes one frame and returns the number of bytes put on the wire.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<usize, FrameError> {
    let bytes = encode_frame(magic, command, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len())
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
) -> Result<Frame, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let got_magic = [header[0], header[1], header[2], header[3]];
    if got_magic != magic {
        return Err(FrameError::BadMagic(got_magic));
    }
    let command = parse_command(&header[4..16])?;
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(FrameError::TooLarge(length));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    if header[20..24] != checksum(&payload) {
        return Err(FrameError::BadChecksum);
    }
    Ok(Frame { command, payload })
}

fn parse_command(raw: &[u8]) -> Result<String, FrameError> {
    let len = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(len);
    if name.is_empty()
        || !name.iter().all(u8::is_ascii_graphic)
        || padding.iter().any(|byte| *byte != 0)
    {
        return Err(FrameError::BadCommand);
    }
    Ok(name.iter().map(|byte| *byte as char).collect())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn ours(user_agent: &str, start_height: i32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: unix_now(),
            nonce: rand::random(),
            user_agent: user_agent.to_string(),
            start_height,
            relay: false,
        }
    }
}

pub fn build_version_payload(message: &VersionMessage) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(message.version);
    encoder.write_u64_le(message.services);
    encoder.write_i64_le(message.timestamp);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    write_net_addr(&mut encoder, message.services, [0u8; 16], 0);
    encoder.write_u64_le(message.nonce);
    encoder.write_var_str(&message.user_agent);
    encoder.write_i32_le(message.start_height);
    encoder.write_u8(message.relay as u8);
    encoder.into_inner()
}

pub fn parse_version(payload: &[u8]) -> Result<VersionMessage, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let timestamp = decoder.read_i64_le().map_err(|err| err.to_string())?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let nonce = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let user_agent = decoder.read_var_str().map_err(|err| err.to_string())?;
    let start_height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    // The relay flag is optional on the wire.
    let relay = if decoder.is_empty() {
        true
    } else {
        decoder.read_u8().map_err(|err| err.to_string())? != 0
    };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetHeadersRequest {
    pub version: i32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

pub fn build_getheaders_payload(locator: &[Hash256], stop: &Hash256) -> Result<Vec<u8>, String> {
    if locator.len() > MAX_LOCATOR_SZ {
        return Err(format!(
            "locator has {} entries (max {MAX_LOCATOR_SZ})",
            locator.len()
        ));
    }
    let mut encoder = Encoder::with_capacity(4 + 9 + 32 * (locator.len() + 1));
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(stop);
    Ok(encoder.into_inner())
}

pub fn parse_getheaders(payload: &[u8]) -> Result<GetHeadersRequest, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "locator count too large".to_string())?;
    if count > MAX_LOCATOR_SZ {
        return Err("locator count too large".to_string());
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.read_hash_le().map_err(|err| err.to_string())?);
    }
    let stop = decoder.read_hash_le().map_err(|err| err.to_string())?;
    if !decoder.is_empty() {
        return Err("trailing bytes in getheaders payload".to_string());
    }
    Ok(GetHeadersRequest {
        version,
        locator,
        stop,
    })
}

pub fn build_headers_payload(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(9 + headers.len() * 81);
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        header.encode_into(&mut encoder);
        encoder.write_varint(0);
    }
    encoder.into_inner()
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "header count too large".to_string())?;
    if count > MAX_HEADERS_RESULTS {
        return Err(format!("header count {count} exceeds {MAX_HEADERS_RESULTS}"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header =
            BlockHeader::consensus_decode_from(&mut decoder).map_err(|err| err.to_string())?;
        let _tx_count = decoder.read_varint().map_err(|err| err.to_string())?;
        headers.push(header);
    }
    if !decoder.is_empty() {
        return Err("trailing bytes in headers payload".to_string());
    }
    Ok(headers)
}

pub fn build_nonce_payload(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

/// Payload of `ping` and `pong`.
pub fn parse_nonce(payload: &[u8]) -> Result<u64, String> {
    let mut decoder = Decoder::new(payload);
    let nonce = decoder.read_u64_le().map_err(|err| err.to_string())?;
    if !decoder.is_empty() {
        return Err("trailing bytes in nonce payload".to_string());
    }
    Ok(nonce)
}

#[derive(Clone, Debug)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Option<Hash256>,
}

pub fn parse_reject(payload: &[u8]) -> Result<RejectMessage, String> {
    let mut decoder = Decoder::new(payload);
    let message = decoder.read_var_str().map_err(|err| err.to_string())?;
    let code = decoder.read_u8().map_err(|err| err.to_string())?;
    let reason = decoder.read_var_str().map_err(|err| err.to_string())?;
    let data = match decoder.remaining() {
        32 => Some(decoder.read_hash_le().map_err(|err| err.to_string())?),
        _ => None,
    };
    Ok(RejectMessage {
        message,
        code,
        reason,
        data,
    })
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_u16_be(port);
}

fn read_net_addr(decoder: &mut Decoder) -> Result<(), String> {
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _ip = decoder.read_fixed::<16>().map_err(|err| err.to_string())?;
    let _port = decoder.read_u16_be().map_err(|err| err.to_string())?;
    Ok(())
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfoSnapshot {
    pub id: PeerId,
    pub addr: String,
    pub state: &'static str,
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub connected_since: u64,
    pub last_send: u64,
    pub last_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Clone, Debug)]
struct PeerEntry {
    addr: SocketAddr,
    state: PeerState,
    version: i32,
    services: u64,
    user_agent: String,
    start_height: i32,
    connected_since: SystemTime,
    last_send: SystemTime,
    last_recv: SystemTime,
    bytes_sent: u64,
    bytes_recv: u64,
    handle: Option<PeerHandle>,
}

/// Live sessions, their advertised versions and command handles.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    next_id: AtomicU64,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl PeerRegistry {
    pub fn register(&self, addr: SocketAddr) -> PeerId {
        let now = SystemTime::now();
        let entry = PeerEntry {
            addr,
            state: PeerState::Handshaking,
            version: 0,
            services: 0,
            user_agent: String::new(),
            start_height: -1,
            connected_since: now,
            last_send: now,
            last_recv: now,
            bytes_sent: 0,
            bytes_recv: 0,
            handle: None,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(id, entry);
        }
        id
    }

    pub fn attach_handle(&self, id: PeerId, handle: PeerHandle) {
        self.with_entry(id, |entry| entry.handle = Some(handle));
    }

    pub fn set_state(&self, id: PeerId, state: PeerState) {
        self.with_entry(id, |entry| entry.state = state);
    }

    pub fn update_version(&self, id: PeerId, message: &VersionMessage) {
        self.with_entry(id, |entry| {
            entry.version = message.version;
            entry.services = message.services;
            entry.user_agent = message.user_agent.clone();
            entry.start_height = message.start_height;
        });
    }

    pub fn bump_start_height(&self, id: PeerId, height: i32) {
        self.with_entry(id, |entry| entry.start_height = entry.start_height.max(height));
    }

    pub fn note_send(&self, id: PeerId, bytes: usize) {
        let now = SystemTime::now();
        self.with_entry(id, |entry| {
            entry.last_send = now;
            entry.bytes_sent = entry.bytes_sent.saturating_add(bytes as u64);
        });
    }

    pub fn note_recv(&self, id: PeerId, bytes: usize) {
        let now = SystemTime::now();
        self.with_entry(id, |entry| {
            entry.last_recv = now;
            entry.bytes_recv = entry.bytes_recv.saturating_add(bytes as u64);
        });
    }

    pub fn remove(&self, id: PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.peers
            .lock()
            .map(|peers| peers.values().any(|entry| &entry.addr == addr))
            .unwrap_or(false)
    }

    pub fn handle(&self, id: PeerId) -> Option<PeerHandle> {
        self.peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(&id).and_then(|entry| entry.handle.clone()))
    }

    pub fn start_height(&self, id: PeerId) -> Option<i32> {
        self.peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(&id).map(|entry| entry.start_height))
    }

    /// Handshaken sessions, highest advertised start height first.
    pub fn sync_candidates(&self) -> Vec<(PeerHandle, i32)> {
        let Ok(peers) = self.peers.lock() else {
            return Vec::new();
        };
        let mut out: Vec<(PeerId, PeerHandle, i32)> = peers
            .iter()
            .filter(|(_, entry)| matches!(
                    entry.state,
                    PeerState::Ready | PeerState::Syncing | PeerState::Idle
                ))
            .filter_map(|(id, entry)| {
                entry
                    .handle
                    .clone()
                    .map(|handle| (*id, handle, entry.start_height))
            })
            .collect();
        out.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        out.into_iter()
            .map(|(_, handle, height)| (handle, height))
            .collect()
    }

    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers
            .lock()
            .map(|peers| peers.values().filter_map(|entry| entry.handle.clone()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<PeerInfoSnapshot> {
        let Ok(peers) = self.peers.lock() else {
            return Vec::new();
        };
        let mut out: Vec<PeerInfoSnapshot> = peers
            .iter()
            .map(|(id, entry)| PeerInfoSnapshot {
                id: *id,
                addr: entry.addr.to_string(),
                state: entry.state.as_str(),
                version: entry.version,
                services: entry.services,
                user_agent: entry.user_agent.clone(),
                start_height: entry.start_height,
                connected_since: unix_secs(entry.connected_since),
                last_send: unix_secs(entry.last_send),
                last_recv: unix_secs(entry.last_recv),
                bytes_sent: entry.bytes_sent,
                bytes_recv: entry.bytes_recv,
            })
            .collect();
        out.sort_by_key(|peer| peer.id);
        out
    }

    fn with_entry(&self, id: PeerId, f: impl FnOnce(&mut PeerEntry)) {
        if let Ok(mut peers) = self.peers.lock() {
            if let Some(entry) = peers.get_mut(&id) {
                f(entry);
            }
        }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetTotalsSnapshot {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub connections: usize,
}

#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    connections: AtomicUsize,
}

impl NetTotals {
    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            })
            .ok();
    }

    pub fn snapshot(&self) -> NetTotalsSnapshot {
        NetTotalsSnapshot {
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}
