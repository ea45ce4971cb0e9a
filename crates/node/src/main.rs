use headerd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod config;
pub mod http;
pub mod notify;
pub mod p2p;
pub mod peer_book;
pub mod session;
pub mod stats;
pub mod sync;
pub mod tokens;
pub mod views;
pub mod webhooks;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use headerd_chainstate::{ChainEngine, ChainStore};
use headerd_consensus::chain_params;
use headerd_storage::fjall::FjallStore;
use headerd_storage::memory::MemoryStore;
use headerd_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::{parse_args, usage, CliAction, Config, DbDsn};
use crate::http::{serve_http, HttpState};
use crate::notify::{MinreqPoster, NotificationBus, WebhookDispatcher};
use crate::session::SessionConfig;
use crate::sync::{SyncOrchestrator, SyncSettings, SyncShared};
use crate::tokens::TokenStore;
use crate::webhooks::WebhookStore;

/// The backend chosen by `db_dsn`.
pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.flush(),
            Store::Fjall(store) => store.flush(),
        }
    }
}

pub fn open_store(dsn: &DbDsn) -> Result<Store, String> {
    match dsn {
        DbDsn::Memory => {
            log_warn!("Using in-memory store; headers are lost on exit");
            Ok(Store::Memory(MemoryStore::new()))
        }
        DbDsn::Fjall(path) => {
            std::fs::create_dir_all(path)
                .map_err(|err| format!("failed to create {}: {err}", path.display()))?;
            FjallStore::open(path)
                .map(Store::Fjall)
                .map_err(|err| format!("failed to open store at {}: {err}", path.display()))
        }
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("headerd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(Instant::now(), *config).await,
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    log_info!(
        "Startup: network={}, db={}, data_dir={}",
        config.network,
        config.db,
        config.data_dir.display()
    );

    let params = chain_params(config.network);
    let store = Arc::new(open_store(&config.db)?);
    let chain = ChainStore::open(Arc::clone(&store), &params).map_err(|err| err.to_string())?;

    let (bus, webhook_queue) = NotificationBus::with_webhook_queue();
    let bus = Arc::new(bus);
    let engine = Arc::new(ChainEngine::new(chain, params.clone(), bus.clone()));
    let tip = engine.tip_of_longest().map_err(|err| err.to_string())?;
    log_info!(
        "Chain tip {} at height {} ({} headers)",
        tip.display_hash(),
        tip.height,
        engine.count().map_err(|err| err.to_string())?
    );

    let tokens = Arc::new(TokenStore::new(Arc::clone(&store)));
    if let Some(token) = &config.auth_token {
        tokens.ensure_admin(token).map_err(|err| err.to_string())?;
    }
    if !config.use_auth {
        log_warn!("HTTP authentication disabled");
    }
    let webhooks = Arc::new(WebhookStore::new(
        Arc::clone(&store),
        config.webhook_max_tries,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = WebhookDispatcher::new(Arc::clone(&webhooks), Arc::new(MinreqPoster::default()));
    let dispatcher_task = tokio::spawn(dispatcher.run(webhook_queue, shutdown_rx.clone()));

    let shared = SyncShared::default();
    let banlist_path = config.banlist_path();
    match shared.peer_book.load_banlist(&banlist_path) {
        Ok(0) => {}
        Ok(count) => log_info!("Loaded {count} ban(s) from {}", banlist_path.display()),
        Err(err) => log_warn!("Ignoring banlist: {err}"),
    }

    let session_config = SessionConfig::new(
        config.network_magic,
        config.min_protocol_version,
        config.user_agent.clone(),
    );
    let settings = SyncSettings::new(
        config.seed_peers.clone(),
        params.default_port,
        config.max_peers,
        params.ibd_height_drift,
    );
    let sync = SyncOrchestrator::start(
        Arc::clone(&engine),
        settings,
        session_config,
        shared.clone(),
    );

    let http_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http_port));
    let listener = TcpListener::bind(http_addr)
        .await
        .map_err(|err| format!("http bind {http_addr} failed: {err}"))?;
    let http_state = Arc::new(HttpState {
        engine: Arc::clone(&engine),
        tokens,
        webhooks,
        bus,
        sync: shared.clone(),
        sync_mode: sync.subscribe_mode(),
        network: config.network,
        started: start_time,
        use_auth: config.use_auth,
    });
    let http_task = tokio::spawn(serve_http(listener, http_state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("failed to wait for ctrl-c: {err}"))?;
    log_info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    sync.shutdown().await;
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log_warn!("HTTP server: {err}"),
        Err(err) => log_warn!("HTTP task: {err}"),
    }
    if let Err(err) = dispatcher_task.await {
        log_warn!("Webhook dispatcher: {err}");
    }

    if let Err(err) = shared.peer_book.save_banlist(&banlist_path) {
        log_warn!("Failed to save banlist: {err}");
    }
    if let Err(err) = store.flush() {
        log_error!("Store flush failed: {err}");
    }
    log_info!("Shutdown complete");
    Ok(())
}
