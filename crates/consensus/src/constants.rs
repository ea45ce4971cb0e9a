//! Network-wide constants used by header validation and the peer protocol.

/// Number of previous headers whose median timestamp a new header must exceed.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Maximum number of seconds a header timestamp may be ahead of local time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Maximum number of headers a peer may return in one `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2_000;
/// Maximum number of hashes in a `getheaders` block locator.
pub const MAX_LOCATOR_SZ: usize = 101;
/// Maximum payload of a single P2P message.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;
/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: i32 = 70_015;
/// Lowest protocol version we complete a handshake with.
pub const MIN_PEER_PROTO_VERSION: i32 = 70_013;
/// Service bit for peers that serve the full chain.
pub const NODE_NETWORK: u64 = 1;
/// Size of a serialized block header.
pub const BLOCK_HEADER_SIZE: usize = 80;
