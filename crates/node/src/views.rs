//! JSON shapes shared by the HTTP routes and the notification sinks.

use headerd_chainstate::{ChainEvent, IndexedHeader};
use headerd_consensus::hash256_to_hex;
use primitive_types::U256;
use serde::Serialize;

/// Big-endian hex, 64 chars.
pub fn u256_hex(value: &U256) -> String {
    value
        .to_big_endian()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderView {
    pub hash: String,
    pub version: i32,
    pub prev_block_hash: String,
    pub merkle_root: String,
    pub creation_timestamp: u32,
    pub difficulty_target: u32,
    pub nonce: u32,
    pub work: String,
    pub height: i32,
}

impl From<&IndexedHeader> for HeaderView {
    fn from(record: &IndexedHeader) -> Self {
        Self {
            hash: hash256_to_hex(&record.hash),
            version: record.header.version,
            prev_block_hash: hash256_to_hex(&record.header.prev_block),
            merkle_root: hash256_to_hex(&record.header.merkle_root),
            creation_timestamp: record.header.time,
            difficulty_target: record.header.bits,
            nonce: record.header.nonce,
            work: u256_hex(&record.work()),
            height: record.height,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderStateView {
    pub header: HeaderView,
    pub state: &'static str,
    pub chain_work: String,
    pub height: i32,
}

impl From<&IndexedHeader> for HeaderStateView {
    fn from(record: &IndexedHeader) -> Self {
        Self {
            header: HeaderView::from(record),
            state: record.state.as_str(),
            chain_work: u256_hex(&record.chainwork),
            height: record.height,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    pub operation: &'static str,
    pub header: HeaderStateView,
}

impl From<&ChainEvent> for EventView {
    fn from(event: &ChainEvent) -> Self {
        Self {
            operation: event.operation.as_str(),
            header: HeaderStateView::from(&event.header),
        }
    }
}
