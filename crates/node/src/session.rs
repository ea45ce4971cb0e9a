//! One task per connected peer: handshake, header requests, keepalive and
//! misbehaviour accounting.
//!
//! The orchestrator talks to a session through its [`PeerHandle`]; the session
//! reports back through [`PeerEvent`]s on a shared channel.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use headerd_chainstate::ChainEngine;
use headerd_consensus::constants::{MAX_HEADERS_RESULTS, NODE_NETWORK};
use headerd_consensus::{hash256_to_hex, Hash256};
use headerd_primitives::BlockHeader;
use headerd_storage::KeyValueStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};

use crate::p2p::{
    build_getheaders_payload, build_nonce_payload, build_version_payload, parse_headers,
    parse_nonce, parse_reject, parse_version, read_frame, write_frame, Frame, FrameError,
    NetTotals, PeerId, PeerRegistry, VersionMessage,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 16;
const FRAME_QUEUE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Ready,
    Syncing,
    Idle,
    Disconnected,
    Banned,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Handshaking => "HANDSHAKING",
            PeerState::Ready => "READY",
            PeerState::Syncing => "SYNCING",
            PeerState::Idle => "IDLE",
            PeerState::Disconnected => "DISCONNECTED",
            PeerState::Banned => "BANNED",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    Io(String),
    Timeout(&'static str),
    Protocol(String),
    Malformed(String),
    /// A header request is already in flight on this session.
    Busy,
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(err) => write!(f, "i/o error: {err}"),
            SessionError::Timeout(what) => write!(f, "{what} timed out"),
            SessionError::Protocol(reason) => write!(f, "protocol violation: {reason}"),
            SessionError::Malformed(reason) => write!(f, "malformed message: {reason}"),
            SessionError::Busy => f.write_str("header request already in flight"),
            SessionError::Closed => f.write_str("session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        if err.is_malformed() {
            SessionError::Malformed(err.to_string())
        } else {
            SessionError::Io(err.to_string())
        }
    }
}

/// Lets a session check that a response attaches to the header tree.
pub trait KnownHeaders: Send + Sync {
    fn knows(&self, hash: &Hash256) -> bool;
    fn best_height(&self) -> i32;
}

impl<S: KeyValueStore> KnownHeaders for ChainEngine<S> {
    fn knows(&self, hash: &Hash256) -> bool {
        self.exists(hash).unwrap_or(false)
    }

    fn best_height(&self) -> i32 {
        self.tip_of_longest().map(|tip| tip.height).unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionTimeouts {
    pub handshake: Duration,
    pub response: Duration,
    pub idle: Duration,
    pub pong: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            response: Duration::from_secs(60),
            idle: Duration::from_secs(5 * 60),
            pong: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub magic: [u8; 4],
    pub min_protocol_version: i32,
    pub user_agent: String,
    pub timeouts: SessionTimeouts,
    pub violation_limit: usize,
    pub violation_window: Duration,
}

impl SessionConfig {
    pub fn new(magic: [u8; 4], min_protocol_version: i32, user_agent: String) -> Self {
        Self {
            magic,
            min_protocol_version,
            user_agent,
            timeouts: SessionTimeouts::default(),
            violation_limit: 10,
            violation_window: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<SessionConfig>,
    pub known: Arc<dyn KnownHeaders>,
    pub registry: Arc<PeerRegistry>,
    pub totals: Arc<NetTotals>,
    pub events: mpsc::Sender<PeerEvent>,
}

#[derive(Debug)]
pub enum PeerEvent {
    Ready {
        peer: PeerId,
        addr: SocketAddr,
        version: VersionMessage,
    },
    /// Headers pushed without a request from us.
    Announced {
        peer: PeerId,
        headers: Vec<BlockHeader>,
    },
    Closed {
        peer: PeerId,
        addr: SocketAddr,
        reason: String,
        banned: bool,
    },
}

type HeadersReply = oneshot::Sender<Result<Vec<BlockHeader>, SessionError>>;

#[derive(Debug)]
enum SessionCommand {
    RequestHeaders {
        locator: Vec<Hash256>,
        stop: Hash256,
        reply: HeadersReply,
    },
    Ban(String),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct PeerHandle {
    id: PeerId,
    addr: SocketAddr,
    commands: mpsc::Sender<SessionCommand>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends `getheaders` and waits for the matching `headers` reply. The
    /// returned headers chain to each other and the first one extends a
    /// locator entry or a header we already hold.
    pub async fn request_headers(
        &self,
        locator: Vec<Hash256>,
        stop: Hash256,
    ) -> Result<Vec<BlockHeader>, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::RequestHeaders {
                locator,
                stop,
                reply,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn ban(&self, reason: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::Ban(reason.into())).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
    }
}

/// Registers the peer and spawns its session task.
pub fn spawn_session<T>(stream: T, addr: SocketAddr, ctx: SessionContext) -> PeerHandle
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = ctx.registry.register(addr);
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    let handle = PeerHandle {
        id,
        addr,
        commands: commands_tx,
    };
    ctx.registry.attach_handle(id, handle.clone());
    tokio::spawn(run_session(stream, id, addr, ctx, commands_rx));
    handle
}

enum Exit {
    Disconnected(String),
    Banned(String),
}

impl Exit {
    fn from_error(err: SessionError) -> Self {
        match err {
            SessionError::Malformed(_) => Exit::Banned(err.to_string()),
            other => Exit::Disconnected(other.to_string()),
        }
    }
}

async fn run_session<T>(
    mut stream: T,
    id: PeerId,
    addr: SocketAddr,
    ctx: SessionContext,
    mut commands: mpsc::Receiver<SessionCommand>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    ctx.totals.inc_connections();
    let exit = match handshake(&mut stream, id, &ctx).await {
        Ok(version) => {
            log_info!(
                "peer {addr} ready (version {}, agent {}, height {})",
                version.version,
                version.user_agent,
                version.start_height
            );
            ctx.registry.update_version(id, &version);
            ctx.registry.set_state(id, PeerState::Ready);
            let _ = ctx
                .events
                .send(PeerEvent::Ready {
                    peer: id,
                    addr,
                    version,
                })
                .await;

            let (reader, writer) = tokio::io::split(stream);
            let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
            let reader_task = tokio::spawn(read_loop(reader, ctx.config.magic, frames_tx));
            let mut session = Session::new(id, addr, ctx.clone(), writer);
            let exit = session.run(&mut commands, frames_rx).await;
            reader_task.abort();
            session.fail_pending(SessionError::Closed);
            exit
        }
        Err(exit) => exit,
    };

    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let SessionCommand::RequestHeaders { reply, .. } = command {
            let _ = reply.send(Err(SessionError::Closed));
        }
    }

    let (reason, banned) = match exit {
        Exit::Disconnected(reason) => {
            log_info!("peer {addr} disconnected: {reason}");
            (reason, false)
        }
        Exit::Banned(reason) => {
            log_warn!("peer {addr} banned: {reason}");
            (reason, true)
        }
    };
    ctx.registry.remove(id);
    ctx.totals.dec_connections();
    let _ = ctx
        .events
        .send(PeerEvent::Closed {
            peer: id,
            addr,
            reason,
            banned,
        })
        .await;
}

async fn send_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: PeerId,
    ctx: &SessionContext,
    command: &str,
    payload: &[u8],
) -> Result<(), SessionError> {
    let written = timeout(
        SEND_TIMEOUT,
        write_frame(writer, ctx.config.magic, command, payload),
    )
    .await
    .map_err(|_| SessionError::Timeout("peer write"))??;
    ctx.totals.add_sent(written);
    ctx.registry.note_send(id, written);
    Ok(())
}

async fn handshake<T>(stream: &mut T, id: PeerId, ctx: &SessionContext) -> Result<VersionMessage, Exit>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let ours = VersionMessage::ours(&ctx.config.user_agent, ctx.known.best_height());
    send_frame(stream, id, ctx, "version", &build_version_payload(&ours))
        .await
        .map_err(Exit::from_error)?;

    let deadline = Instant::now() + ctx.config.timeouts.handshake;
    let mut remote: Option<VersionMessage> = None;
    let mut got_verack = false;
    loop {
        if got_verack {
            if let Some(version) = remote.take() {
                return Ok(version);
            }
        }
        let frame = match timeout_at(deadline, read_frame(stream, ctx.config.magic)).await {
            Err(_) => return Err(Exit::Disconnected("handshake timed out".to_string())),
            Ok(Err(err)) => return Err(Exit::from_error(err.into())),
            Ok(Ok(frame)) => frame,
        };
        ctx.totals.add_recv(frame.wire_len());
        ctx.registry.note_recv(id, frame.wire_len());

        match frame.command.as_str() {
            "version" => {
                if remote.is_some() {
                    return Err(Exit::Disconnected("duplicate version".to_string()));
                }
                let version = parse_version(&frame.payload)
                    .map_err(|err| Exit::Banned(format!("malformed version: {err}")))?;
                if version.version < ctx.config.min_protocol_version {
                    return Err(Exit::Disconnected(format!(
                        "protocol version {} below minimum {}",
                        version.version, ctx.config.min_protocol_version
                    )));
                }
                if version.services & NODE_NETWORK == 0 {
                    return Err(Exit::Disconnected(
                        "peer does not advertise NODE_NETWORK".to_string(),
                    ));
                }
                send_frame(stream, id, ctx, "verack", &[])
                    .await
                    .map_err(Exit::from_error)?;
                remote = Some(version);
            }
            "verack" => got_verack = true,
            "ping" => {
                send_frame(stream, id, ctx, "pong", &frame.payload)
                    .await
                    .map_err(Exit::from_error)?;
            }
            "reject" => log_reject(&frame),
            other => log_trace!("ignoring {other} during handshake"),
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    magic: [u8; 4],
    frames: mpsc::Sender<Result<Frame, FrameError>>,
) {
    loop {
        let result = read_frame(&mut reader, magic).await;
        let failed = result.is_err();
        if frames.send(result).await.is_err() || failed {
            break;
        }
    }
}

fn log_reject(frame: &Frame) {
    match parse_reject(&frame.payload) {
        Ok(reject) => log_warn!(
            "peer rejected {} (code {:#04x}): {}",
            reject.message,
            reject.code,
            reject.reason
        ),
        Err(err) => log_debug!("unparseable reject: {err}"),
    }
}

/// True when each header's parent is the header before it.
fn links_chain(headers: &[BlockHeader]) -> bool {
    headers
        .windows(2)
        .all(|pair| pair[1].prev_block == pair[0].hash())
}

struct PendingRequest {
    locator: Vec<Hash256>,
    reply: HeadersReply,
    deadline: Instant,
}

struct Session<W> {
    id: PeerId,
    addr: SocketAddr,
    ctx: SessionContext,
    writer: W,
    pending: Option<PendingRequest>,
    violations: VecDeque<Instant>,
    last_recv: Instant,
    ping: Option<(u64, Instant)>,
}

impl<W: AsyncWrite + Unpin> Session<W> {
    fn new(id: PeerId, addr: SocketAddr, ctx: SessionContext, writer: W) -> Self {
        Self {
            id,
            addr,
            ctx,
            writer,
            pending: None,
            violations: VecDeque::new(),
            last_recv: Instant::now(),
            ping: None,
        }
    }

    async fn run(
        &mut self,
        commands: &mut mpsc::Receiver<SessionCommand>,
        mut frames: mpsc::Receiver<Result<Frame, FrameError>>,
    ) -> Exit {
        loop {
            let wake = self.next_wakeup();
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => Err(Exit::Disconnected("session handle dropped".to_string())),
                },
                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(err)) => Err(Exit::from_error(err.into())),
                    None => Err(Exit::Disconnected("connection closed".to_string())),
                },
                _ = sleep_until(wake) => self.on_timer().await,
            };
            if let Err(exit) = step {
                return exit;
            }
        }
    }

    fn next_wakeup(&self) -> Instant {
        let timeouts = self.ctx.config.timeouts;
        let keepalive = match self.ping {
            Some((_, sent)) => sent + timeouts.pong,
            None => self.last_recv + timeouts.idle,
        };
        match &self.pending {
            Some(pending) => pending.deadline.min(keepalive),
            None => keepalive,
        }
    }

    fn set_state(&self, state: PeerState) {
        self.ctx.registry.set_state(self.id, state);
    }

    async fn send(&mut self, command: &str, payload: &[u8]) -> Result<(), Exit> {
        send_frame(&mut self.writer, self.id, &self.ctx, command, payload)
            .await
            .map_err(Exit::from_error)
    }

    fn fail_pending(&mut self, err: SessionError) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(err));
        }
    }

    async fn on_command(&mut self, command: SessionCommand) -> Result<(), Exit> {
        match command {
            SessionCommand::RequestHeaders {
                locator,
                stop,
                reply,
            } => {
                if self.pending.is_some() {
                    let _ = reply.send(Err(SessionError::Busy));
                    return Ok(());
                }
                let payload = match build_getheaders_payload(&locator, &stop) {
                    Ok(payload) => payload,
                    Err(err) => {
                        let _ = reply.send(Err(SessionError::Protocol(err)));
                        return Ok(());
                    }
                };
                self.send("getheaders", &payload).await?;
                log_debug!(
                    "getheaders to {} from {}",
                    self.addr,
                    locator
                        .first()
                        .map(hash256_to_hex)
                        .unwrap_or_else(|| "genesis".to_string())
                );
                self.pending = Some(PendingRequest {
                    locator,
                    reply,
                    deadline: Instant::now() + self.ctx.config.timeouts.response,
                });
                self.set_state(PeerState::Syncing);
                Ok(())
            }
            SessionCommand::Ban(reason) => Err(Exit::Banned(reason)),
            SessionCommand::Shutdown => Err(Exit::Disconnected("shutdown".to_string())),
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), Exit> {
        self.last_recv = Instant::now();
        self.ctx.totals.add_recv(frame.wire_len());
        self.ctx.registry.note_recv(self.id, frame.wire_len());

        match frame.command.as_str() {
            "headers" => match parse_headers(&frame.payload) {
                Ok(headers) => self.on_headers(headers).await,
                Err(err) => {
                    self.fail_pending(SessionError::Malformed(err.clone()));
                    Err(Exit::Banned(format!("malformed headers: {err}")))
                }
            },
            "ping" => match parse_nonce(&frame.payload) {
                Ok(_) => self.send("pong", &frame.payload).await,
                Err(err) => self.violation(&format!("bad ping: {err}")),
            },
            "pong" => {
                if let (Some((expected, _)), Ok(nonce)) = (self.ping, parse_nonce(&frame.payload)) {
                    if nonce == expected {
                        self.ping = None;
                    }
                }
                Ok(())
            }
            "reject" => {
                log_reject(&frame);
                Ok(())
            }
            "version" | "verack" => self.violation("handshake message after handshake"),
            other => {
                log_trace!("ignoring {other} from {}", self.addr);
                Ok(())
            }
        }
    }

    async fn on_headers(&mut self, headers: Vec<BlockHeader>) -> Result<(), Exit> {
        if !links_chain(&headers) {
            self.fail_pending(SessionError::Malformed("headers do not chain".to_string()));
            return Err(Exit::Banned("headers do not chain".to_string()));
        }

        let Some(pending) = self.pending.take() else {
            if headers.is_empty() {
                return Ok(());
            }
            if let Some(last) = headers.last() {
                log_debug!(
                    "{} announced {} header(s) up to {}",
                    self.addr,
                    headers.len(),
                    last.display_hash()
                );
            }
            let _ = self
                .ctx
                .events
                .send(PeerEvent::Announced {
                    peer: self.id,
                    headers,
                })
                .await;
            return Ok(());
        };

        if let Some(first) = headers.first() {
            let parent = first.prev_block;
            if !pending.locator.contains(&parent) && !self.ctx.known.knows(&parent) {
                let _ = pending.reply.send(Err(SessionError::Protocol(
                    "headers response does not connect".to_string(),
                )));
                self.set_state(PeerState::Idle);
                return self.violation("unconnected headers response");
            }
        }

        let state = if headers.len() < MAX_HEADERS_RESULTS {
            PeerState::Idle
        } else {
            PeerState::Syncing
        };
        self.set_state(state);
        let _ = pending.reply.send(Ok(headers));
        Ok(())
    }

    async fn on_timer(&mut self) -> Result<(), Exit> {
        let now = Instant::now();
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| now >= pending.deadline)
        {
            self.fail_pending(SessionError::Timeout("headers response"));
            return Err(Exit::Disconnected("headers response timed out".to_string()));
        }
        let timeouts = self.ctx.config.timeouts;
        match self.ping {
            Some((_, sent)) if now >= sent + timeouts.pong => {
                Err(Exit::Disconnected("ping timeout".to_string()))
            }
            None if now >= self.last_recv + timeouts.idle => {
                let nonce: u64 = rand::random();
                self.send("ping", &build_nonce_payload(nonce)).await?;
                self.ping = Some((nonce, now));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn violation(&mut self, what: &str) -> Result<(), Exit> {
        let now = Instant::now();
        let window = self.ctx.config.violation_window;
        self.violations.push_back(now);
        while self
            .violations
            .front()
            .is_some_and(|first| now.duration_since(*first) > window)
        {
            self.violations.pop_front();
        }
        log_debug!(
            "protocol violation from {}: {what} ({} in window)",
            self.addr,
            self.violations.len()
        );
        if self.violations.len() > self.ctx.config.violation_limit {
            return Err(Exit::Banned(format!(
                "{} protocol violations within {}s",
                self.violations.len(),
                window.as_secs()
            )));
        }
        Ok(())
    }
}
