//! In-memory overlay of one batch's changes.
//!
//! Later headers in a batch read through the overlay so they observe earlier
//! placements before anything reaches the store; the whole delta is then
//! committed as one `WriteBatch`.

use std::collections::{BTreeMap, HashMap};

use headerd_consensus::Hash256;
use headerd_storage::{Column, WriteBatch};

use crate::record::IndexedHeader;
use crate::store::{
    child_key, EMPTY, height_key, merkle_key, META_HEADER_COUNT, META_LONGEST_TIP, META_NEXT_SEQUENCE,
};

#[derive(Debug, Default)]
pub struct ChainDelta {
    records: HashMap<Hash256, IndexedHeader>,
    children: HashMap<Hash256, Vec<Hash256>>,
    merkle: Vec<(Hash256, Hash256)>,
    tips: HashMap<Hash256, bool>,
    removed: HashMap<Hash256, IndexedHeader>,
    heights: BTreeMap<i32, Option<Hash256>>,
    tip: Option<IndexedHeader>,
    tip_changed: bool,
    header_count: u64,
    next_sequence: u64,
    inserted: usize,
}

impl ChainDelta {
    pub fn new(tip: Option<IndexedHeader>, header_count: u64, next_sequence: u64) -> Self {
        Self {
            tip,
            header_count,
            next_sequence,
            ..Self::default()
        }
    }

    pub fn record(&self, hash: &Hash256) -> Option<&IndexedHeader> {
        self.records.get(hash)
    }

    pub fn is_removed(&self, hash: &Hash256) -> bool {
        self.removed.contains_key(hash)
    }

    pub fn children(&self, parent: &Hash256) -> &[Hash256] {
        self.children.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `Some(None)` means the height was cleared in this batch.
    pub fn height(&self, height: i32) -> Option<Option<Hash256>> {
        self.heights.get(&height).copied()
    }

    pub fn tip(&self) -> Option<&IndexedHeader> {
        self.tip.as_ref()
    }

    pub fn header_count(&self) -> u64 {
        self.header_count
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.removed.is_empty()
    }

    pub fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Adds a record seen for the first time. `has_children` is true when
    /// orphans referencing it are already known.
    pub fn insert_new(&mut self, record: IndexedHeader, has_children: bool) {
        let hash = record.hash;
        if !record.header.is_genesis() {
            let parent = record.header.prev_block;
            self.children.entry(parent).or_default().push(hash);
            self.tips.insert(parent, false);
        }
        self.merkle.push((record.header.merkle_root, hash));
        self.tips.insert(hash, !has_children);
        self.header_count += 1;
        self.inserted += 1;
        self.records.insert(hash, record);
    }

    pub fn update(&mut self, record: IndexedHeader) {
        if self.tip.as_ref().is_some_and(|tip| tip.hash == record.hash) {
            self.tip = Some(record.clone());
        }
        self.records.insert(record.hash, record);
    }

    /// Drops a record staged earlier in this batch or committed before it,
    /// together with its index entries. Its own children are left in place.
    pub fn remove(&mut self, record: IndexedHeader) {
        let hash = record.hash;
        self.records.remove(&hash);
        if let Some(siblings) = self.children.get_mut(&record.header.prev_block) {
            siblings.retain(|child| *child != hash);
        }
        self.merkle.retain(|(_, staged)| *staged != hash);
        self.tips.remove(&hash);
        self.header_count = self.header_count.saturating_sub(1);
        self.removed.insert(hash, record);
    }

    pub fn mark_tip(&mut self, hash: Hash256, is_tip: bool) {
        self.tips.insert(hash, is_tip);
    }

    pub fn set_height(&mut self, height: i32, hash: Hash256) {
        self.heights.insert(height, Some(hash));
    }

    pub fn clear_height(&mut self, height: i32) {
        self.heights.insert(height, None);
    }

    pub fn set_tip(&mut self, record: IndexedHeader) {
        self.tip = Some(record);
        self.tip_changed = true;
    }

    pub fn to_write_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (hash, record) in &self.records {
            batch.put(Column::Header, hash, record.encode());
        }
        for (parent, children) in &self.children {
            for child in children {
                batch.put(Column::ChildIndex, child_key(parent, child), EMPTY);
            }
        }
        for (root, hash) in &self.merkle {
            batch.put(Column::MerkleIndex, merkle_key(root, hash), EMPTY);
        }
        for (hash, is_tip) in &self.tips {
            if *is_tip {
                batch.put(Column::TipIndex, hash, EMPTY);
            } else {
                batch.delete(Column::TipIndex, hash);
            }
        }
        for (hash, record) in &self.removed {
            batch.delete(Column::Header, hash);
            batch.delete(Column::ChildIndex, child_key(&record.header.prev_block, hash));
            batch.delete(Column::MerkleIndex, merkle_key(&record.header.merkle_root, hash));
            batch.delete(Column::TipIndex, hash);
        }
        for (height, hash) in &self.heights {
            match hash {
                Some(hash) => batch.put(Column::HeightIndex, height_key(*height), hash),
                None => batch.delete(Column::HeightIndex, height_key(*height)),
            }
        }
        if self.tip_changed {
            if let Some(tip) = &self.tip {
                batch.put(Column::Meta, META_LONGEST_TIP, tip.hash);
            }
        }
        if self.inserted > 0 || !self.removed.is_empty() {
            batch.put(Column::Meta, META_HEADER_COUNT, self.header_count.to_le_bytes());
            batch.put(Column::Meta, META_NEXT_SEQUENCE, self.next_sequence.to_le_bytes());
        }
        batch
    }
}
