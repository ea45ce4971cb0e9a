//! Fan-out of committed chain events to subscribers and webhooks.
//!
//! The engine calls [`NotificationBus::on_chain_event`] with its write lock
//! held, so publishing only touches `watch` slots and an unbounded queue.
//! Webhook delivery happens on the dispatcher task, one queue and worker per
//! registered endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use headerd_chainstate::{ChainEvent, ChainListener};
use headerd_storage::KeyValueStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::views::EventView;
use crate::webhooks::{AuthHeader, Webhook, WebhookStore};

pub const HEADERS_CHANNEL: &str = "headers";

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);
const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// An event together with its position in the publish order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub sequence: u64,
    pub event: ChainEvent,
}

pub type Subscription = watch::Receiver<Option<Arc<Published>>>;

pub struct NotificationBus {
    channels: Mutex<HashMap<String, watch::Sender<Option<Arc<Published>>>>>,
    webhooks: Option<mpsc::UnboundedSender<Arc<Published>>>,
    sequence: AtomicU64,
}

impl NotificationBus {
    /// A bus with no webhook sink.
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            webhooks: None,
            sequence: AtomicU64::new(0),
        }
    }

    /// A bus whose `headers` events are also queued for the webhook dispatcher.
    pub fn with_webhook_queue() -> (Self, mpsc::UnboundedReceiver<Arc<Published>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            webhooks: Some(tx),
            ..Self::new()
        };
        (bus, rx)
    }

    /// Latest-value subscription; slow readers skip intermediate events.
    pub fn subscribe(&self, channel: &str) -> Option<Subscription> {
        let mut channels = self.channels.lock().ok()?;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| watch::channel(None).0);
        Some(sender.subscribe())
    }

    pub fn latest(&self, channel: &str) -> Option<Arc<Published>> {
        let channels = self.channels.lock().ok()?;
        channels
            .get(channel)
            .and_then(|sender| sender.borrow().clone())
    }

    pub fn publish(&self, channel: &str, event: ChainEvent) -> Arc<Published> {
        let published = Arc::new(Published {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            event,
        });
        if let Ok(mut channels) = self.channels.lock() {
            channels
                .entry(channel.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .send_replace(Some(Arc::clone(&published)));
        }
        published
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainListener for NotificationBus {
    fn on_chain_event(&self, event: &ChainEvent) {
        let published = self.publish(HEADERS_CHANNEL, event.clone());
        if let Some(queue) = &self.webhooks {
            let _ = queue.send(published);
        }
    }
}

/// Blocking HTTP POST used for webhook delivery.
pub trait WebhookPoster: Send + Sync + 'static {
    fn post(&self, url: &str, auth: Option<&AuthHeader>, body: &[u8]) -> Result<(), String>;
}

pub struct MinreqPoster {
    timeout_secs: u64,
}

impl Default for MinreqPoster {
    fn default() -> Self {
        Self {
            timeout_secs: WEBHOOK_TIMEOUT_SECS,
        }
    }
}

impl WebhookPoster for MinreqPoster {
    fn post(&self, url: &str, auth: Option<&AuthHeader>, body: &[u8]) -> Result<(), String> {
        let mut request = minreq::post(url)
            .with_header("Content-Type", "application/json")
            .with_timeout(self.timeout_secs)
            .with_body(body.to_vec());
        if let Some(auth) = auth {
            request = request.with_header(auth.name.as_str(), auth.value.as_str());
        }
        let response = request
            .send()
            .map_err(|err| format!("post failed: {url} ({err})"))?;
        if !(200..300).contains(&response.status_code) {
            return Err(format!("post failed: {url} (HTTP {})", response.status_code));
        }
        Ok(())
    }
}

/// `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(cap)
}

pub struct WebhookDispatcher<S> {
    store: Arc<WebhookStore<S>>,
    poster: Arc<dyn WebhookPoster>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl<S: KeyValueStore + 'static> WebhookDispatcher<S> {
    pub fn new(store: Arc<WebhookStore<S>>, poster: Arc<dyn WebhookPoster>) -> Self {
        Self {
            store,
            poster,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Runs until the queue closes or `shutdown` flips to true.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<Arc<Published>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let this = Arc::new(self);
        let mut workers: HashMap<String, mpsc::UnboundedSender<Arc<Vec<u8>>>> = HashMap::new();
        let mut tasks = JoinSet::new();
        loop {
            let published = tokio::select! {
                published = events.recv() => match published {
                    Some(published) => published,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let body = match serde_json::to_vec(&EventView::from(&published.event)) {
                Ok(body) => Arc::new(body),
                Err(err) => {
                    log_error!("failed to encode event {}: {err}", published.sequence);
                    continue;
                }
            };
            let active = match this.store.active() {
                Ok(active) => active,
                Err(err) => {
                    log_warn!("webhook list unavailable: {err}");
                    continue;
                }
            };

            workers.retain(|url, queue| {
                !queue.is_closed() && active.iter().any(|hook| &hook.url == url)
            });
            for hook in active {
                let queue = workers.entry(hook.url.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tasks.spawn(Arc::clone(&this).deliver_loop(hook.url.clone(), rx));
                    tx
                });
                let _ = queue.send(Arc::clone(&body));
            }
            while tasks.try_join_next().is_some() {}
        }
        drop(workers);
        tasks.shutdown().await;
    }

    async fn deliver_loop(
        self: Arc<Self>,
        url: String,
        mut bodies: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    ) {
        while let Some(body) = bodies.recv().await {
            if !self.deliver(&url, body).await {
                log_warn!("webhook {url} disabled after repeated failures");
                return;
            }
        }
    }

    /// Retries one body with backoff. Returns false once the webhook is no
    /// longer active.
    async fn deliver(&self, url: &str, body: Arc<Vec<u8>>) -> bool {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let Some(webhook) = self.current(url) else {
                return false;
            };
            let poster = Arc::clone(&self.poster);
            let payload = Arc::clone(&body);
            let target = url.to_string();
            let result = tokio::task::spawn_blocking(move || {
                poster.post(&target, webhook.auth_header.as_ref(), &payload)
            })
            .await
            .unwrap_or_else(|err| Err(format!("delivery task failed: {err}")));

            let delivered = result.is_ok();
            if let Err(err) = &result {
                log_debug!("webhook attempt {attempt} to {url} failed: {err}");
            }
            let updated = match self.store.record_delivery(url, delivered) {
                Ok(updated) => updated,
                Err(err) => {
                    log_warn!("failed to record webhook delivery for {url}: {err}");
                    None
                }
            };
            if delivered {
                return true;
            }
            match updated {
                Some(webhook) if webhook.active => {}
                _ => return false,
            }
            tokio::time::sleep(backoff_delay(attempt, self.backoff_base, self.backoff_cap)).await;
        }
    }

    fn current(&self, url: &str) -> Option<Webhook> {
        self.store
            .get(url)
            .ok()
            .flatten()
            .filter(|webhook| webhook.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headerd_chainstate::{ChainOperation, HeaderState, IndexedHeader};
    use headerd_consensus::{chain_params, Network};
    use headerd_primitives::BlockHeader;
    use headerd_storage::memory::MemoryStore;
    use primitive_types::U256;

    fn event(operation: ChainOperation) -> ChainEvent {
        let header = BlockHeader::genesis(&chain_params(Network::Regtest).genesis);
        ChainEvent {
            operation,
            header: IndexedHeader {
                header,
                hash: header.hash(),
                height: 0,
                chainwork: U256::from(2u64),
                state: HeaderState::LongestChain,
                sequence: 0,
            },
        }
    }

    /// Fails the first `failures` posts, then records bodies.
    struct ScriptedPoster {
        failures: Mutex<u32>,
        delivered: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl ScriptedPoster {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn delivered(&self) -> Vec<(String, Vec<u8>)> {
            self.delivered.lock().expect("lock").clone()
        }
    }

    impl WebhookPoster for ScriptedPoster {
        fn post(&self, url: &str, _auth: Option<&AuthHeader>, body: &[u8]) -> Result<(), String> {
            let mut failures = self.failures.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err("connection refused".to_string());
            }
            self.delivered
                .lock()
                .expect("lock")
                .push((url.to_string(), body.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| backoff_delay(attempt, base, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn subscribers_see_latest_value() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe(HEADERS_CHANNEL).expect("subscribe");
        assert!(sub.borrow().is_none());

        bus.on_chain_event(&event(ChainOperation::Add));
        bus.on_chain_event(&event(ChainOperation::Reorg));
        assert!(sub.has_changed().expect("open"));
        let latest = sub.borrow_and_update().clone().expect("value");
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.event.operation, ChainOperation::Reorg);
        assert_eq!(bus.latest(HEADERS_CHANNEL).expect("latest").sequence, 2);
        assert!(bus.latest("other").is_none());
    }

    #[tokio::test]
    async fn delivers_in_order_with_retries() {
        let store = Arc::new(WebhookStore::new(Arc::new(MemoryStore::new()), 5));
        store.register("http://hook.test/a", None).expect("register");
        let poster = ScriptedPoster::new(2);
        let (bus, queue) = NotificationBus::with_webhook_queue();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = WebhookDispatcher::new(Arc::clone(&store), poster.clone())
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5));
        let task = tokio::spawn(dispatcher.run(queue, shutdown_rx));

        bus.on_chain_event(&event(ChainOperation::Add));
        bus.on_chain_event(&event(ChainOperation::Reorg));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while poster.delivered().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let delivered = poster.delivered();
        assert_eq!(delivered.len(), 2);
        let first: serde_json::Value = serde_json::from_slice(&delivered[0].1).expect("json");
        let second: serde_json::Value = serde_json::from_slice(&delivered[1].1).expect("json");
        assert_eq!(first["operation"], "ADD");
        assert_eq!(second["operation"], "REORG");
        assert_eq!(first["header"]["state"], "LONGEST_CHAIN");

        let hook = store.get("http://hook.test/a").expect("get").expect("present");
        assert_eq!(hook.error_count, 0);
        assert!(hook.active);

        shutdown_tx.send(true).expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test]
    async fn failing_webhook_is_deactivated() {
        let store = Arc::new(WebhookStore::new(Arc::new(MemoryStore::new()), 3));
        store.register("http://hook.test/down", None).expect("register");
        let poster = ScriptedPoster::new(u32::MAX);
        let (bus, queue) = NotificationBus::with_webhook_queue();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = WebhookDispatcher::new(Arc::clone(&store), poster.clone())
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        let task = tokio::spawn(dispatcher.run(queue, shutdown_rx));

        bus.on_chain_event(&event(ChainOperation::Add));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let hook = store.get("http://hook.test/down").expect("get").expect("present");
            if !hook.active {
                assert_eq!(hook.error_count, 3);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "webhook never disabled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(poster.delivered().is_empty());

        drop(bus);
        task.await.expect("join");
    }
}
