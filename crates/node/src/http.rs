use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use headerd_chainstate::{
    merkle_root_page, verify_merkle_roots, ChainEngine, ChainError, ErrorKind, MerkleRootItem,
};
use headerd_consensus::constants::MAX_HEADERS_RESULTS;
use headerd_consensus::params::Network;
use headerd_consensus::{hash256_from_hex, Hash256};
use headerd_storage::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::notify::{NotificationBus, HEADERS_CHANNEL};
use crate::stats::{snapshot_status, StatusSources};
use crate::sync::{SyncMode, SyncShared};
use crate::tokens::TokenStore;
use crate::views::{EventView, HeaderStateView, HeaderView};
use crate::webhooks::{validate_url, AuthHeader, Webhook, WebhookStore};

const MAX_HEAD_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_SECS: u64 = 30;
const MAX_POLL_SECS: u64 = 60;

pub struct HttpState<S> {
    pub engine: Arc<ChainEngine<S>>,
    pub tokens: Arc<TokenStore<S>>,
    pub webhooks: Arc<WebhookStore<S>>,
    pub bus: Arc<NotificationBus>,
    pub sync: SyncShared,
    pub sync_mode: watch::Receiver<SyncMode>,
    pub network: Network,
    pub started: Instant,
    pub use_auth: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method: method.to_string(),
            path,
            query,
            ..Self::default()
        }
    }

    pub fn with_bearer(mut self, token: &str) -> Self {
        self.authorization = Some(format!("Bearer {token}"));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn bearer(&self) -> Option<&str> {
        let value = self.authorization.as_deref()?.trim();
        let (scheme, token) = value.split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("bearer")
            .then(|| token.trim())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, body },
            Err(err) => ApiError::internal(format!("response encoding failed: {err}")).into(),
        }
    }

    fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(400, code, message)
    }

    fn unauthorized() -> Self {
        Self::new(401, "ErrUnauthorized", "missing or invalid bearer token")
    }

    fn forbidden() -> Self {
        Self::new(403, "ErrForbidden", "admin token required")
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, "ErrNotFound", message)
    }

    fn internal(detail: String) -> Self {
        log_error!("http internal error: {detail}");
        Self::new(500, "ErrInternal", "internal server error")
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        match err.kind() {
            ErrorKind::Storage | ErrorKind::InvalidHeader => {
                log_error!("chain request failed: {err}");
                Self::new(err.kind().http_status(), err.code(), "internal storage error")
            }
            kind => Self::new(kind.http_status(), err.code(), err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ChainError::Storage(err).into()
    }
}

impl From<ApiError> for Response {
    fn from(err: ApiError) -> Self {
        let body = serde_json::to_string(&err).unwrap_or_default();
        Response {
            status: err.status,
            body,
        }
    }
}

type ApiResult = Result<Response, ApiError>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Public,
    Token,
    Admin,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MerkleRootView {
    merkle_root: String,
    block_height: i32,
}

impl From<&MerkleRootItem> for MerkleRootView {
    fn from(item: &MerkleRootItem) -> Self {
        Self {
            merkle_root: item.merkle_root.clone(),
            block_height: item.block_height,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MerkleRootPageView {
    content: Vec<MerkleRootView>,
    size: usize,
    total_elements: u64,
    last_evaluated_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerdictView {
    merkle_root: String,
    block_height: i32,
    confirmation: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirmations: Option<i32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerificationView {
    confirmation_state: &'static str,
    items: Vec<VerdictView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MerkleRootInput {
    merkle_root: String,
    block_height: i32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookInput {
    url: String,
    #[serde(default)]
    auth_header: Option<AuthHeader>,
}

/// Registered webhook without its auth header value.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookView {
    url: String,
    created_at: u64,
    last_emitted_at: Option<u64>,
    error_count: u32,
    active: bool,
}

impl From<Webhook> for WebhookView {
    fn from(webhook: Webhook) -> Self {
        Self {
            url: webhook.url,
            created_at: webhook.created_at,
            last_emitted_at: webhook.last_emitted_at,
            error_count: webhook.error_count,
            active: webhook.active,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishedView {
    sequence: u64,
    #[serde(flatten)]
    event: EventView,
}

pub async fn serve_http<S: KeyValueStore + 'static>(
    listener: TcpListener,
    state: Arc<HttpState<S>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    if let Ok(addr) = listener.local_addr() {
        log_info!("HTTP listening on http://{addr}");
    }
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => {
                accepted.map_err(|err| format!("http accept failed: {err}"))?
            }
            _ = shutdown.changed() => break,
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, state).await {
                log_debug!("http connection {peer}: {err}");
            }
        });
    }
    log_info!("HTTP server stopped");
    Ok(())
}

async fn handle_connection<S: KeyValueStore + 'static>(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<HttpState<S>>,
) -> Result<(), String> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => {
            let response = Response::from(ApiError::bad_request("ErrBadRequest", err.clone()));
            let _ = stream.write_all(&build_response(&response)).await;
            return Err(err);
        }
        Err(_) => return Err("request read timed out".to_string()),
    };
    log_trace!("{peer} {} {}", request.method, request.path);
    let response = handle_request(&state, request).await;
    stream
        .write_all(&build_response(&response))
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

/// Reads one request. `Ok(None)` when the client closed before sending.
async fn read_request(stream: &mut TcpStream) -> Result<Option<Request>, String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err("request head too large".to_string());
        }
        let read = stream.read(&mut chunk).await.map_err(|err| err.to_string())?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err("connection closed mid-request".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or("missing method")?;
    let target = parts.next().ok_or("missing request target")?;
    let mut request = Request::new(method, target);

    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| format!("invalid content-length '{value}'"))?;
        } else if name.eq_ignore_ascii_case("authorization") {
            request.authorization = Some(value.to_string());
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(format!("body of {content_length} bytes exceeds limit"));
    }

    let mut body = buffer.split_off(head_end + 4);
    while body.len() < content_length {
        let read = stream.read(&mut chunk).await.map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("connection closed mid-body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(Some(request))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_target(target: &str) -> (String, Vec<(String, String)>) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let query = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect();
    (path.to_string(), query)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

fn build_response(response: &Response) -> Vec<u8> {
    let mut head = String::new();
    head.push_str("HTTP/1.1 ");
    head.push_str(&response.status.to_string());
    head.push(' ');
    head.push_str(reason_phrase(response.status));
    if !response.body.is_empty() {
        head.push_str("\r\nContent-Type: application/json");
    }
    head.push_str("\r\nCache-Control: no-store\r\nConnection: close\r\nContent-Length: ");
    head.push_str(&response.body.len().to_string());
    head.push_str("\r\n\r\n");
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(response.body.as_bytes());
    bytes
}

/// Routes one parsed request.
pub async fn handle_request<S: KeyValueStore + 'static>(
    state: &HttpState<S>,
    request: Request,
) -> Response {
    match route(state, &request).await {
        Ok(response) => response,
        Err(err) => err.into(),
    }
}

async fn route<S: KeyValueStore + 'static>(state: &HttpState<S>, request: &Request) -> ApiResult {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let method = request.method.as_str();

    let access = match (method, segments.as_slice()) {
        ("GET", ["status"]) => Access::Public,
        (_, ["access", ..]) => Access::Admin,
        _ => Access::Token,
    };
    authorize(state, request, access)?;

    match (method, segments.as_slice()) {
        ("GET", ["status"]) => status(state),
        ("GET", ["chain", "tip"]) => {
            let tips: Vec<HeaderStateView> =
                state.engine.tips()?.iter().map(HeaderStateView::from).collect();
            Ok(Response::json(200, &tips))
        }
        ("GET", ["chain", "tip", "longest"]) => {
            let tip = state.engine.tip_of_longest()?;
            Ok(Response::json(200, &HeaderStateView::from(&tip)))
        }
        ("GET", ["chain", "tip", "longest", "subscribe"]) => subscribe(state, request).await,
        ("GET", ["chain", "header", "byHeight"]) => headers_by_height(state, request),
        ("GET", ["chain", "header", "state", hash]) => {
            let record = state.engine.header_by_hash(&parse_hash(hash)?)?;
            Ok(Response::json(200, &HeaderStateView::from(&record)))
        }
        ("POST", ["chain", "header", "commonAncestor"]) => {
            let hashes: Vec<String> = parse_json(&request.body)?;
            let hashes = hashes
                .iter()
                .map(|hash| parse_hash(hash))
                .collect::<Result<Vec<_>, _>>()?;
            let ancestor = state.engine.lowest_common_ancestor(&hashes)?;
            Ok(Response::json(200, &HeaderView::from(&ancestor)))
        }
        ("GET", ["chain", "header", hash]) => {
            let record = state.engine.header_by_hash(&parse_hash(hash)?)?;
            Ok(Response::json(200, &HeaderView::from(&record)))
        }
        ("GET", ["chain", "header", hash, ancestor, "ancestor"]) => {
            let chain: Vec<HeaderView> = state
                .engine
                .ancestors(&parse_hash(hash)?, &parse_hash(ancestor)?)?
                .iter()
                .map(HeaderView::from)
                .collect();
            Ok(Response::json(200, &chain))
        }
        ("GET", ["chain", "merkleroot"]) => merkle_roots(state, request),
        ("POST", ["chain", "merkleroot", "verify"]) => verify_roots(state, request),
        ("POST", ["access"]) => {
            let token = state.tokens.create()?;
            log_info!("issued new access token");
            Ok(Response::json(201, &serde_json::json!({ "token": token })))
        }
        ("DELETE", ["access", token]) => {
            if state.tokens.revoke(token)? {
                Ok(Response::empty(204))
            } else {
                Err(ApiError::not_found("token not found"))
            }
        }
        ("GET", ["webhook"]) => {
            let hooks: Vec<WebhookView> = state
                .webhooks
                .list()?
                .into_iter()
                .map(WebhookView::from)
                .collect();
            Ok(Response::json(200, &hooks))
        }
        ("POST", ["webhook"]) => {
            let input: WebhookInput = parse_json(&request.body)?;
            validate_url(&input.url).map_err(|err| ApiError::bad_request("ErrInvalidUrl", err))?;
            let webhook = state.webhooks.register(&input.url, input.auth_header)?;
            log_info!("registered webhook {}", webhook.url);
            Ok(Response::json(201, &WebhookView::from(webhook)))
        }
        ("DELETE", ["webhook"]) => {
            let url = request
                .query_param("url")
                .ok_or_else(|| ApiError::bad_request("ErrInvalidUrl", "missing url parameter"))?;
            if state.webhooks.revoke(url)? {
                log_info!("revoked webhook {url}");
                Ok(Response::empty(204))
            } else {
                Err(ApiError::not_found("webhook not found"))
            }
        }
        _ => Err(ApiError::not_found(format!(
            "no route for {} {}",
            request.method, request.path
        ))),
    }
}

fn authorize<S: KeyValueStore>(
    state: &HttpState<S>,
    request: &Request,
    access: Access,
) -> Result<(), ApiError> {
    if access == Access::Public || !state.use_auth {
        return Ok(());
    }
    let token = request.bearer().ok_or_else(ApiError::unauthorized)?;
    let record = state
        .tokens
        .lookup(token)?
        .ok_or_else(ApiError::unauthorized)?;
    if access == Access::Admin && !record.admin {
        return Err(ApiError::forbidden());
    }
    Ok(())
}

fn parse_hash(hex: &str) -> Result<Hash256, ApiError> {
    if hex.len() != 64 {
        return Err(ChainError::InvalidHash(hex.to_string()).into());
    }
    hash256_from_hex(hex).map_err(|_| ChainError::InvalidHash(hex.to_string()).into())
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request("ErrInvalidJson", format!("invalid JSON body: {err}")))
}

fn parse_int<T: std::str::FromStr>(
    request: &Request,
    name: &str,
    code: &'static str,
) -> Result<Option<T>, ApiError> {
    match request.query_param(name) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(code, format!("invalid {name} '{raw}'"))),
    }
}

fn status<S: KeyValueStore>(state: &HttpState<S>) -> ApiResult {
    let sources = StatusSources {
        engine: state.engine.as_ref(),
        network: state.network,
        started: state.started,
        sync_mode: *state.sync_mode.borrow(),
        registry: state.sync.registry.as_ref(),
        peer_book: state.sync.peer_book.as_ref(),
        net_totals: state.sync.net_totals.as_ref(),
        metrics: state.sync.metrics.as_ref(),
    };
    let snapshot = snapshot_status(&sources).map_err(ApiError::internal)?;
    Ok(Response::json(200, &snapshot))
}

fn headers_by_height<S: KeyValueStore>(state: &HttpState<S>, request: &Request) -> ApiResult {
    let height: i32 = parse_int(request, "height", "ErrInvalidHeight")?
        .ok_or_else(|| ApiError::bad_request("ErrInvalidHeight", "missing height parameter"))?;
    let count: i32 = parse_int(request, "count", "ErrInvalidCount")?.unwrap_or(1);
    if height < 0 {
        return Err(ApiError::bad_request("ErrInvalidHeight", "height must not be negative"));
    }
    if count < 1 || count as usize > MAX_HEADERS_RESULTS {
        return Err(ApiError::bad_request(
            "ErrInvalidCount",
            format!("count must be between 1 and {MAX_HEADERS_RESULTS}"),
        ));
    }
    let tip_height = state.engine.tip_of_longest()?.height;
    if height > tip_height {
        return Err(ChainError::HeaderNotFound(format!("at height {height}")).into());
    }
    let last = tip_height.min(height.saturating_add(count - 1));
    let headers: Vec<HeaderView> = state
        .engine
        .range_on_longest(height, last)?
        .iter()
        .map(HeaderView::from)
        .collect();
    Ok(Response::json(200, &headers))
}

fn merkle_roots<S: KeyValueStore>(state: &HttpState<S>, request: &Request) -> ApiResult {
    let batch_size: Option<i64> = match request.query_param("batchSize") {
        None | Some("") => None,
        Some(raw) => Some(raw.parse().map_err(|_| {
            ApiError::bad_request("ErrInvalidBatchSize", format!("invalid batch size '{raw}'"))
        })?),
    };
    let last_key = request
        .query_param("lastEvaluatedKey")
        .filter(|key| !key.is_empty());
    let page = merkle_root_page(state.engine.store(), batch_size, last_key)?;
    Ok(Response::json(
        200,
        &MerkleRootPageView {
            content: page.content.iter().map(MerkleRootView::from).collect(),
            size: page.size,
            total_elements: page.total_elements,
            last_evaluated_key: page.last_evaluated_key,
        },
    ))
}

fn verify_roots<S: KeyValueStore>(state: &HttpState<S>, request: &Request) -> ApiResult {
    let inputs: Vec<MerkleRootInput> = parse_json(&request.body)?;
    let items: Vec<MerkleRootItem> = inputs
        .into_iter()
        .map(|input| MerkleRootItem {
            merkle_root: input.merkle_root,
            block_height: input.block_height,
        })
        .collect();
    let verification = verify_merkle_roots(state.engine.store(), &items)?;
    Ok(Response::json(
        200,
        &VerificationView {
            confirmation_state: verification.confirmation_state.as_str(),
            items: verification
                .items
                .into_iter()
                .map(|verdict| VerdictView {
                    merkle_root: verdict.item.merkle_root,
                    block_height: verdict.item.block_height,
                    confirmation: verdict.confirmation.as_str(),
                    confirmations: verdict.confirmations,
                })
                .collect(),
        },
    ))
}

/// Long-poll: the latest event with a sequence above `after`, or 204 once
/// `timeout` seconds pass without one.
async fn subscribe<S: KeyValueStore>(state: &HttpState<S>, request: &Request) -> ApiResult {
    let after: u64 = parse_int(request, "after", "ErrInvalidCursor")?.unwrap_or(0);
    let timeout_secs: u64 = parse_int(request, "timeout", "ErrInvalidTimeout")?
        .unwrap_or(DEFAULT_POLL_SECS)
        .min(MAX_POLL_SECS);
    let mut subscription = state
        .bus
        .subscribe(HEADERS_CHANNEL)
        .ok_or_else(|| ApiError::internal("notification bus unavailable".to_string()))?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        let current = subscription.borrow_and_update().clone();
        if let Some(published) = current.filter(|published| published.sequence > after) {
            return Ok(Response::json(
                200,
                &PublishedView {
                    sequence: published.sequence,
                    event: EventView::from(&published.event),
                },
            ));
        }
        match tokio::time::timeout_at(deadline, subscription.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => return Ok(Response::empty(204)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_decodes_query() {
        let request = Request::new("DELETE", "/webhook?url=http%3A%2F%2Fhost%3A80%2Fa+b&x");
        assert_eq!(request.path, "/webhook");
        assert_eq!(request.query_param("url"), Some("http://host:80/a b"));
        assert_eq!(request.query_param("x"), Some(""));
        assert_eq!(request.query_param("y"), None);
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut request = Request::new("GET", "/chain/tip").with_bearer("abc");
        assert_eq!(request.bearer(), Some("abc"));
        request.authorization = Some("bearer  xyz ".to_string());
        assert_eq!(request.bearer(), Some("xyz"));
        request.authorization = Some("Basic abc".to_string());
        assert_eq!(request.bearer(), None);
    }

    #[test]
    fn response_framing() {
        let bytes = build_response(&Response {
            status: 404,
            body: "{}".to_string(),
        });
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));

        let text = String::from_utf8(build_response(&Response::empty(204))).expect("utf8");
        assert!(!text.contains("Content-Type"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn storage_errors_hide_detail() {
        let err = ApiError::from(StoreError::Backend("disk path /secret".to_string()));
        assert_eq!(err.status, 500);
        assert_eq!(err.code, "ErrStorage");
        assert!(!err.message.contains("secret"));

        let err = ApiError::from(ChainError::InvalidBatchSize(-1));
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "ErrInvalidBatchSize");
    }
}
