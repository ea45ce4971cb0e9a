//! Merkle-root confirmation against the longest chain, and the paginated
//! merkle-root listing.

use headerd_consensus::{hash256_from_hex, hash256_to_hex, Hash256};
use headerd_storage::{KeyValueStore, StoreError};

use crate::error::ChainError;
use crate::store::{ChainReader, ChainStore};

/// Page size used when the caller passes no batch size (or zero).
pub const DEFAULT_PAGE_SIZE: usize = 2_000;
/// Largest page a single request may ask for.
pub const MAX_PAGE_SIZE: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleRootItem {
    /// Display-order hex, as clients know it.
    pub merkle_root: String,
    pub block_height: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Invalid,
    UnableToVerify,
}

impl Confirmation {
    pub fn as_str(self) -> &'static str {
        match self {
            Confirmation::Confirmed => "CONFIRMED",
            Confirmation::Invalid => "INVALID",
            Confirmation::UnableToVerify => "UNABLE_TO_VERIFY",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemVerdict {
    pub item: MerkleRootItem,
    pub confirmation: Confirmation,
    /// `tip height - block height + 1` for confirmed items.
    pub confirmations: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleVerification {
    pub confirmation_state: Confirmation,
    pub items: Vec<ItemVerdict>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleRootPage {
    pub content: Vec<MerkleRootItem>,
    pub size: usize,
    pub total_elements: u64,
    pub last_evaluated_key: Option<String>,
}

/// Something that can confirm a merkle root at a height.
pub trait ChainTracker {
    fn is_valid_root_for_height(&self, root: &Hash256, height: i32) -> Result<bool, ChainError>;
    fn current_height(&self) -> Result<i32, ChainError>;
}

impl<S: KeyValueStore> ChainTracker for ChainStore<S> {
    fn is_valid_root_for_height(&self, root: &Hash256, height: i32) -> Result<bool, ChainError> {
        Ok(self
            .get_by_height_on_longest(height)?
            .is_some_and(|record| record.header.merkle_root == *root))
    }

    fn current_height(&self) -> Result<i32, ChainError> {
        Ok(self.get_tip_of_longest()?.height)
    }
}

/// Aggregate: all confirmed ⇒ CONFIRMED, any invalid ⇒ INVALID, otherwise
/// UNABLE_TO_VERIFY.
pub fn verify_merkle_roots<S: KeyValueStore>(
    store: &ChainStore<S>,
    items: &[MerkleRootItem],
) -> Result<MerkleVerification, ChainError> {
    if items.is_empty() {
        return Err(ChainError::EmptyMerkleRootList);
    }
    store.read(|reader| {
        let tip_height = reader.get_tip_of_longest()?.height;
        let mut verdicts = Vec::with_capacity(items.len());
        for item in items {
            verdicts.push(verify_item(reader, tip_height, item)?);
        }

        let confirmation_state = if verdicts
            .iter()
            .all(|v| v.confirmation == Confirmation::Confirmed)
        {
            Confirmation::Confirmed
        } else if verdicts
            .iter()
            .any(|v| v.confirmation == Confirmation::Invalid)
        {
            Confirmation::Invalid
        } else {
            Confirmation::UnableToVerify
        };
        Ok(MerkleVerification {
            confirmation_state,
            items: verdicts,
        })
    })
}

fn verify_item<S: KeyValueStore>(
    reader: &ChainReader<'_, S>,
    tip_height: i32,
    item: &MerkleRootItem,
) -> Result<ItemVerdict, StoreError> {
    let verdict = |confirmation, confirmations| ItemVerdict {
        item: item.clone(),
        confirmation,
        confirmations,
    };
    if item.block_height > tip_height {
        return Ok(verdict(Confirmation::UnableToVerify, None));
    }
    let Some(record) = reader.get_by_height_on_longest(item.block_height)? else {
        return Ok(verdict(Confirmation::Invalid, None));
    };
    match hash256_from_hex(&item.merkle_root) {
        Ok(root) if item.merkle_root.trim().len() == 64 && root == record.header.merkle_root => {
            Ok(verdict(
                Confirmation::Confirmed,
                Some(tip_height - record.height + 1),
            ))
        }
        _ => Ok(verdict(Confirmation::Invalid, None)),
    }
}

/// One page of `(merkle root, height)` pairs from the longest chain in
/// ascending height order, starting after `last_evaluated_key`.
pub fn merkle_root_page<S: KeyValueStore>(
    store: &ChainStore<S>,
    batch_size: Option<i64>,
    last_evaluated_key: Option<&str>,
) -> Result<MerkleRootPage, ChainError> {
    let page_size = match batch_size {
        Some(size) if size < 0 => return Err(ChainError::InvalidBatchSize(size)),
        Some(0) | None => DEFAULT_PAGE_SIZE,
        Some(size) => (size as u64).min(MAX_PAGE_SIZE as u64) as usize,
    };

    store.read(|reader| {
        let tip_height = reader.get_tip_of_longest()?.height;
        let start = match last_evaluated_key {
            Some(key) => key_height(reader, key)? + 1,
            None => 0,
        };
        let end = tip_height.min(start.saturating_add(page_size as i32 - 1));

        let content: Vec<MerkleRootItem> = reader
            .get_range_on_longest(start, end)?
            .into_iter()
            .map(|record| MerkleRootItem {
                merkle_root: hash256_to_hex(&record.header.merkle_root),
                block_height: record.height,
            })
            .collect();
        let last_evaluated_key = content.last().map(|item| item.merkle_root.clone());
        Ok(MerkleRootPage {
            size: content.len(),
            content,
            total_elements: (tip_height as u64) + 1,
            last_evaluated_key,
        })
    })
}

/// Height of the longest-chain header carrying `key` as its merkle root.
fn key_height<S: KeyValueStore>(reader: &ChainReader<'_, S>, key: &str) -> Result<i32, ChainError> {
    let root = hash256_from_hex(key).map_err(|_| ChainError::MerkleRootNotFound(key.to_string()))?;
    let holders = reader.headers_with_merkle_root(&root)?;
    if holders.is_empty() {
        return Err(ChainError::MerkleRootNotFound(key.to_string()));
    }
    holders
        .iter()
        .find(|record| record.is_longest())
        .map(|record| record.height)
        .ok_or_else(|| ChainError::MerkleRootNotInLongestChain(key.to_string()))
}
