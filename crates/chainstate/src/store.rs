//! Header records and their secondary indexes on top of a [`KeyValueStore`].

use std::sync::{Arc, RwLock};

use headerd_consensus::{hash256_to_hex, ChainParams, Hash256};
use headerd_primitives::block::BlockHeader;
use headerd_storage::{Column, KeyValueStore, StoreError};

use crate::error::ChainError;
use crate::migrations;
use crate::pending::ChainDelta;
use crate::record::{HeaderState, IndexedHeader};

pub(crate) const META_SCHEMA_VERSION: &[u8] = b"schema_version";
pub(crate) const META_LONGEST_TIP: &[u8] = b"longest_tip";
pub(crate) const META_HEADER_COUNT: &[u8] = b"header_count";
pub(crate) const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";
pub(crate) const EMPTY: &[u8] = &[];

/// Big-endian so a prefix scan walks heights in ascending order.
pub fn height_key(height: i32) -> [u8; 4] {
    (height.max(0) as u32).to_be_bytes()
}

pub fn child_key(parent: &Hash256, child: &Hash256) -> [u8; 64] {
    concat_hashes(parent, child)
}

pub fn merkle_key(root: &Hash256, hash: &Hash256) -> [u8; 64] {
    concat_hashes(root, hash)
}

fn concat_hashes(left: &Hash256, right: &Hash256) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(left);
    key[32..].copy_from_slice(right);
    key
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 32-byte hash, got {}", bytes.len())))
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("expected 8-byte counter".to_string()))?;
    Ok(u64::from_le_bytes(raw))
}

/// Read-only view. Obtain one through [`ChainStore::read`] to get a view that
/// no commit can interleave with.
pub struct ChainReader<'a, S> {
    store: &'a S,
}

impl<'a, S: KeyValueStore> ChainReader<'a, S> {
    pub fn get_by_hash(&self, hash: &Hash256) -> Result<Option<IndexedHeader>, StoreError> {
        match self.store.get(Column::Header, hash)? {
            Some(bytes) => IndexedHeader::decode(*hash, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn exists(&self, hash: &Hash256) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::Header, hash)?.is_some())
    }

    pub fn hash_at_height(&self, height: i32) -> Result<Option<Hash256>, StoreError> {
        if height < 0 {
            return Ok(None);
        }
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_by_height_on_longest(
        &self,
        height: i32,
    ) -> Result<Option<IndexedHeader>, StoreError> {
        match self.hash_at_height(height)? {
            Some(hash) => self.get_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn get_children_of(&self, parent: &Hash256) -> Result<Vec<Hash256>, StoreError> {
        self.store
            .scan_prefix(Column::ChildIndex, parent)?
            .into_iter()
            .map(|(key, _)| decode_hash(&key[32..]))
            .collect()
    }

    pub fn has_children(&self, parent: &Hash256) -> Result<bool, StoreError> {
        let mut found = false;
        self.store
            .for_each_prefix(Column::ChildIndex, parent, &mut |_, _| {
                found = true;
                Ok(false)
            })?;
        Ok(found)
    }

    pub fn longest_tip_hash(&self) -> Result<Option<Hash256>, StoreError> {
        match self.store.get(Column::Meta, META_LONGEST_TIP)? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_tip_of_longest(&self) -> Result<IndexedHeader, StoreError> {
        let hash = self
            .longest_tip_hash()?
            .ok_or_else(|| StoreError::Corrupt("longest tip pointer missing".to_string()))?;
        self.get_by_hash(&hash)?.ok_or_else(|| {
            StoreError::Corrupt(format!("longest tip {} missing", hash256_to_hex(&hash)))
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        match self.store.get(Column::Meta, META_HEADER_COUNT)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    pub fn next_sequence(&self) -> Result<u64, StoreError> {
        match self.store.get(Column::Meta, META_NEXT_SEQUENCE)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Contiguous slice of the longest chain, both ends inclusive.
    pub fn get_range_on_longest(
        &self,
        from_height: i32,
        to_height: i32,
    ) -> Result<Vec<IndexedHeader>, ChainError> {
        if from_height > to_height {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity((to_height - from_height + 1) as usize);
        for height in from_height..=to_height {
            let record = self
                .get_by_height_on_longest(height)?
                .ok_or_else(|| ChainError::HeaderNotFound(format!("at height {height}")))?;
            out.push(record);
        }
        Ok(out)
    }

    /// Walks parents from `hash` while they are stale. The first non-stale
    /// ancestor is not included.
    pub fn get_stale_backwards_from(
        &self,
        hash: &Hash256,
    ) -> Result<Vec<IndexedHeader>, ChainError> {
        let mut current = self
            .get_by_hash(hash)?
            .ok_or_else(|| ChainError::header_not_found(hash))?;
        let mut out = Vec::new();
        while current.state == HeaderState::Stale {
            let parent = *current.prev_hash();
            out.push(current);
            current = match self.get_by_hash(&parent)? {
                Some(record) => record,
                None => break,
            };
        }
        Ok(out)
    }

    pub fn tips(&self) -> Result<Vec<IndexedHeader>, StoreError> {
        let mut out = Vec::new();
        for (key, _) in self.store.scan_prefix(Column::TipIndex, EMPTY)? {
            let hash = decode_hash(&key)?;
            if let Some(record) = self.get_by_hash(&hash)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn headers_with_merkle_root(
        &self,
        root: &Hash256,
    ) -> Result<Vec<IndexedHeader>, StoreError> {
        let mut out = Vec::new();
        for (key, _) in self.store.scan_prefix(Column::MerkleIndex, root)? {
            let hash = decode_hash(&key[32..])?;
            if let Some(record) = self.get_by_hash(&hash)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

pub struct ChainStore<S> {
    store: Arc<S>,
    commit_lock: RwLock<()>,
}

impl<S: KeyValueStore> ChainStore<S> {
    /// Applies pending migrations and seeds the network's genesis header on
    /// an empty store.
    pub fn open(store: Arc<S>, params: &ChainParams) -> Result<Self, ChainError> {
        migrations::migrate(store.as_ref())?;
        let chain = Self {
            store,
            commit_lock: RwLock::new(()),
        };
        chain.ensure_genesis(params)?;
        Ok(chain)
    }

    fn ensure_genesis(&self, params: &ChainParams) -> Result<(), ChainError> {
        let reader = self.reader();
        if let Some(existing) = reader.hash_at_height(0)? {
            if existing != params.genesis.hash {
                return Err(ChainError::Storage(StoreError::Corrupt(format!(
                    "store genesis {} does not belong to {}",
                    hash256_to_hex(&existing),
                    params.network
                ))));
            }
            return Ok(());
        }

        let header = BlockHeader::genesis(&params.genesis);
        let hash = header.hash();
        let mut delta = ChainDelta::new(None, reader.count()?, reader.next_sequence()?);
        let record = IndexedHeader {
            header,
            hash,
            height: 0,
            chainwork: headerd_pow::work(header.bits),
            state: HeaderState::LongestChain,
            sequence: delta.take_sequence(),
        };
        let has_children = reader.has_children(&hash)?;
        delta.insert_new(record.clone(), has_children);
        delta.set_height(0, hash);
        delta.set_tip(record);
        self.insert_batch(&delta)?;
        headerd_log::log_info!(
            "seeded {} genesis {}",
            params.network,
            hash256_to_hex(&hash)
        );
        Ok(())
    }

    /// Runs `f` against a view that no commit can interleave with.
    pub fn read<R>(&self, f: impl FnOnce(&ChainReader<'_, S>) -> R) -> R {
        let _guard = self
            .commit_lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&self.reader())
    }

    /// Unsynchronised view for the single writer, which already excludes
    /// other commits.
    pub(crate) fn reader(&self) -> ChainReader<'_, S> {
        ChainReader {
            store: self.store.as_ref(),
        }
    }

    /// Commits every change in `delta` atomically.
    pub fn insert_batch(&self, delta: &ChainDelta) -> Result<(), StoreError> {
        let batch = delta.to_write_batch();
        let _guard = self
            .commit_lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.store.write_batch(&batch)
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.store
    }

    pub fn get_by_hash(&self, hash: &Hash256) -> Result<Option<IndexedHeader>, StoreError> {
        self.read(|reader| reader.get_by_hash(hash))
    }

    pub fn get_by_height_on_longest(
        &self,
        height: i32,
    ) -> Result<Option<IndexedHeader>, StoreError> {
        self.read(|reader| reader.get_by_height_on_longest(height))
    }

    pub fn get_children_of(&self, parent: &Hash256) -> Result<Vec<Hash256>, StoreError> {
        self.read(|reader| reader.get_children_of(parent))
    }

    pub fn get_tip_of_longest(&self) -> Result<IndexedHeader, StoreError> {
        self.read(|reader| reader.get_tip_of_longest())
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.read(|reader| reader.count())
    }

    pub fn exists(&self, hash: &Hash256) -> Result<bool, StoreError> {
        self.read(|reader| reader.exists(hash))
    }

    pub fn get_range_on_longest(
        &self,
        from_height: i32,
        to_height: i32,
    ) -> Result<Vec<IndexedHeader>, ChainError> {
        self.read(|reader| reader.get_range_on_longest(from_height, to_height))
    }

    pub fn get_stale_backwards_from(
        &self,
        hash: &Hash256,
    ) -> Result<Vec<IndexedHeader>, ChainError> {
        self.read(|reader| reader.get_stale_backwards_from(hash))
    }

    pub fn tips(&self) -> Result<Vec<IndexedHeader>, StoreError> {
        self.read(|reader| reader.tips())
    }
}
