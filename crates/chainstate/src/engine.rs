//! The single writer over chain state.
//!
//! `add_headers` classifies each header (known, orphan, extends the longest
//! chain, stale), promotes orphans whose parent arrives, and reorganises when
//! another branch overtakes the longest tip. A whole batch is staged in a
//! [`ChainDelta`] and committed at once.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use headerd_consensus::{hash256_to_hex, ChainParams, Hash256};
use headerd_log::{log_debug, log_info, log_warn};
use headerd_pow::validation::validate_pow_header;
use headerd_primitives::block::BlockHeader;
use headerd_storage::{KeyValueStore, StoreError};

use crate::error::ChainError;
use crate::events::{ChainEvent, ChainListener, ChainOperation};
use crate::pending::ChainDelta;
use crate::record::{HeaderState, IndexedHeader};
use crate::store::{ChainReader, ChainStore};

/// Seconds since the unix epoch; injectable so tests can pin "now".
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(current_time_secs)
}

fn current_time_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Known,
    Orphan,
    Extended,
    Stale,
    Reorganized { fork_height: i32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    pub hash: Hash256,
    pub placement: Placement,
    /// Orphans that found their ancestry because of this header.
    pub promoted: Vec<Hash256>,
}

pub struct ChainEngine<S> {
    store: ChainStore<S>,
    params: ChainParams,
    write_lock: Mutex<()>,
    listener: Arc<dyn ChainListener>,
    clock: Clock,
}

/// Reads through the batch overlay first, then the committed store.
struct Staged<'a, 'b, S> {
    reader: ChainReader<'a, S>,
    delta: &'b mut ChainDelta,
}

impl<S: KeyValueStore> Staged<'_, '_, S> {
    fn record(&self, hash: &Hash256) -> Result<Option<IndexedHeader>, StoreError> {
        if self.delta.is_removed(hash) {
            return Ok(None);
        }
        match self.delta.record(hash) {
            Some(record) => Ok(Some(record.clone())),
            None => self.reader.get_by_hash(hash),
        }
    }

    fn children(&self, parent: &Hash256) -> Result<Vec<Hash256>, StoreError> {
        let mut children = self.reader.get_children_of(parent)?;
        children.retain(|child| !self.delta.is_removed(child));
        for child in self.delta.children(parent) {
            if !children.contains(child) {
                children.push(*child);
            }
        }
        Ok(children)
    }

    fn hash_at_height(&self, height: i32) -> Result<Option<Hash256>, StoreError> {
        match self.delta.height(height) {
            Some(staged) => Ok(staged),
            None => self.reader.hash_at_height(height),
        }
    }

    fn tip(&self) -> Result<IndexedHeader, StoreError> {
        self.delta
            .tip()
            .cloned()
            .ok_or_else(|| StoreError::Corrupt("longest tip missing".to_string()))
    }

    /// Median timestamp of `prev` and up to `span - 1` of its ancestors.
    fn median_time_past(&self, prev: &IndexedHeader, span: usize) -> Result<i64, StoreError> {
        let mut times = Vec::with_capacity(span);
        let mut current = Some(prev.clone());
        while let Some(record) = current {
            times.push(record.header.time as i64);
            if times.len() == span || record.header.is_genesis() {
                break;
            }
            current = self.record(record.prev_hash())?;
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }
}

impl<S: KeyValueStore> ChainEngine<S> {
    pub fn new(store: ChainStore<S>, params: ChainParams, listener: Arc<dyn ChainListener>) -> Self {
        Self::with_clock(store, params, listener, system_clock())
    }

    pub fn with_clock(
        store: ChainStore<S>,
        params: ChainParams,
        listener: Arc<dyn ChainListener>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            params,
            write_lock: Mutex::new(()),
            listener,
            clock,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn store(&self) -> &ChainStore<S> {
        &self.store
    }

    pub fn add_header(&self, header: &BlockHeader) -> Result<AddOutcome, ChainError> {
        let mut outcomes = self.add_headers(std::slice::from_ref(header))?;
        outcomes
            .pop()
            .ok_or_else(|| ChainError::Storage(StoreError::Backend("empty outcome".to_string())))
    }

    /// Admits `headers` in order and commits them as one batch. An invalid
    /// header aborts the batch; nothing is written and its index is reported.
    pub fn add_headers(&self, headers: &[BlockHeader]) -> Result<Vec<AddOutcome>, ChainError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let reader = self.store.reader();
        let tip = reader.get_tip_of_longest()?;
        let mut delta = ChainDelta::new(Some(tip), reader.count()?, reader.next_sequence()?);
        let mut events = Vec::new();
        let mut outcomes = Vec::with_capacity(headers.len());
        {
            let mut staged = Staged {
                reader,
                delta: &mut delta,
            };
            for (index, header) in headers.iter().enumerate() {
                let outcome = self.admit(&mut staged, header, &mut events).map_err(
                    |err| match err {
                        AdmitError::Invalid(reason) => ChainError::InvalidHeader {
                            index,
                            hash: header.hash(),
                            reason: reason.to_string(),
                        },
                        AdmitError::Store(err) => ChainError::Storage(err),
                    },
                )?;
                outcomes.push(outcome);
            }
        }

        if !delta.is_empty() {
            self.commit(&delta)?;
        }
        for event in &events {
            self.listener.on_chain_event(event);
        }
        Ok(outcomes)
    }

    fn commit(&self, delta: &ChainDelta) -> Result<(), ChainError> {
        match self.store.insert_batch(delta) {
            Ok(()) => Ok(()),
            Err(first) => {
                log_warn!("chain commit failed, retrying once: {first}");
                self.store.insert_batch(delta).map_err(|err| {
                    log_warn!("chain commit failed again: {err}");
                    ChainError::Storage(err)
                })
            }
        }
    }

    fn admit(
        &self,
        staged: &mut Staged<'_, '_, S>,
        header: &BlockHeader,
        events: &mut Vec<ChainEvent>,
    ) -> Result<AddOutcome, AdmitError> {
        let hash = header.hash();
        if staged.record(&hash)?.is_some() {
            return Ok(AddOutcome {
                hash,
                placement: Placement::Known,
                promoted: Vec::new(),
            });
        }

        validate_pow_header(header, &self.params)
            .map_err(|_| AdmitError::Invalid("proof of work check failed"))?;
        let now = (self.clock)();
        if header.time as i64 > now + self.params.max_future_block_time {
            return Err(AdmitError::Invalid("timestamp too far in the future"));
        }
        if header.is_genesis() {
            return Err(AdmitError::Invalid("unexpected second genesis header"));
        }

        let parent = match staged.record(&header.prev_block)? {
            Some(parent) if !parent.is_orphan() => parent,
            _ => {
                let sequence = staged.delta.take_sequence();
                let record = IndexedHeader::orphan(*header, hash, sequence);
                let has_children = !staged.children(&hash)?.is_empty();
                staged.delta.insert_new(record, has_children);
                log_debug!("stored orphan {}", hash256_to_hex(&hash));
                return Ok(AddOutcome {
                    hash,
                    placement: Placement::Orphan,
                    promoted: Vec::new(),
                });
            }
        };

        let mtp = staged.median_time_past(&parent, self.params.median_time_span)?;
        if header.time as i64 <= mtp {
            return Err(AdmitError::Invalid("timestamp not after median time past"));
        }

        let sequence = staged.delta.take_sequence();
        let has_children = !staged.children(&hash)?.is_empty();
        let record = self.place_child(&parent, *header, hash, sequence);
        staged.delta.insert_new(record.clone(), has_children);
        let (placement, mut fork) = self.settle(staged, record, events)?;

        let promoted = self.promote_orphans(staged, hash, events, &mut fork)?;
        let placement = match (placement, fork) {
            (Placement::Stale, Some(fork_height)) => Placement::Reorganized { fork_height },
            (placement, _) => placement,
        };
        Ok(AddOutcome {
            hash,
            placement,
            promoted,
        })
    }

    fn place_child(
        &self,
        parent: &IndexedHeader,
        header: BlockHeader,
        hash: Hash256,
        sequence: u64,
    ) -> IndexedHeader {
        IndexedHeader {
            header,
            hash,
            height: parent.height + 1,
            chainwork: parent.chainwork.saturating_add(headerd_pow::work(header.bits)),
            state: HeaderState::Stale,
            sequence,
        }
    }

    /// Decides the final state of a freshly placed (non-orphan) record:
    /// extend the longest chain, stay stale, or reorganise onto it.
    fn settle(
        &self,
        staged: &mut Staged<'_, '_, S>,
        mut record: IndexedHeader,
        events: &mut Vec<ChainEvent>,
    ) -> Result<(Placement, Option<i32>), StoreError> {
        let tip = staged.tip()?;
        if record.header.prev_block == tip.hash {
            record.state = HeaderState::LongestChain;
            staged.delta.set_height(record.height, record.hash);
            staged.delta.update(record.clone());
            staged.delta.set_tip(record.clone());
            events.push(ChainEvent {
                operation: ChainOperation::Add,
                header: record,
            });
            return Ok((Placement::Extended, None));
        }

        if record.beats(&tip) {
            let fork_height = self.reorganize(staged, record, &tip, events)?;
            return Ok((Placement::Reorganized { fork_height }, Some(fork_height)));
        }
        Ok((Placement::Stale, None))
    }

    /// Moves the longest chain onto `new_tip`. Returns the fork height.
    fn reorganize(
        &self,
        staged: &mut Staged<'_, '_, S>,
        new_tip: IndexedHeader,
        old_tip: &IndexedHeader,
        events: &mut Vec<ChainEvent>,
    ) -> Result<i32, StoreError> {
        // Stale subtrees hang off the longest chain, so the first longest
        // ancestor of the branch is the lowest common ancestor.
        let mut branch = vec![new_tip.clone()];
        let mut cursor = *new_tip.prev_hash();
        let fork = loop {
            let record = staged.record(&cursor)?.ok_or_else(|| {
                StoreError::Corrupt(format!("branch ancestor {} missing", hash256_to_hex(&cursor)))
            })?;
            if record.is_longest() {
                break record;
            }
            cursor = *record.prev_hash();
            branch.push(record);
        };

        for height in (fork.height + 1)..=old_tip.height {
            let Some(hash) = staged.hash_at_height(height)? else {
                continue;
            };
            if let Some(mut demoted) = staged.record(&hash)? {
                demoted.state = HeaderState::Stale;
                staged.delta.update(demoted);
            }
            if height > new_tip.height {
                staged.delta.clear_height(height);
            }
        }

        for mut promoted in branch.into_iter().rev() {
            promoted.state = HeaderState::LongestChain;
            staged.delta.set_height(promoted.height, promoted.hash);
            staged.delta.update(promoted);
        }

        let mut tip = new_tip;
        tip.state = HeaderState::LongestChain;
        staged.delta.set_tip(tip.clone());
        log_info!(
            "reorganized at height {}: {} (height {}) replaces {} (height {})",
            fork.height,
            tip.display_hash(),
            tip.height,
            old_tip.display_hash(),
            old_tip.height
        );
        events.push(ChainEvent {
            operation: ChainOperation::Reorg,
            header: tip,
        });
        Ok(fork.height)
    }

    /// Places every orphan descending from `root`, breadth first. An orphan
    /// whose timestamp does not clear its parent's median time past is
    /// dropped, the same outcome as receiving it after its parent; its own
    /// children stay orphans.
    fn promote_orphans(
        &self,
        staged: &mut Staged<'_, '_, S>,
        root: Hash256,
        events: &mut Vec<ChainEvent>,
        fork: &mut Option<i32>,
    ) -> Result<Vec<Hash256>, AdmitError> {
        let mut promoted = Vec::new();
        let mut worklist = vec![root];
        while let Some(parent_hash) = worklist.pop() {
            let Some(parent) = staged.record(&parent_hash)? else {
                continue;
            };
            for child_hash in staged.children(&parent_hash)? {
                let Some(child) = staged.record(&child_hash)? else {
                    continue;
                };
                if !child.is_orphan() {
                    continue;
                }
                let mtp = staged.median_time_past(&parent, self.params.median_time_span)?;
                if child.header.time as i64 <= mtp {
                    log_warn!(
                        "dropping orphan {}: timestamp not after median time past",
                        child.display_hash()
                    );
                    staged.delta.remove(child);
                    let childless = staged.children(&parent_hash)?.is_empty();
                    staged.delta.mark_tip(parent_hash, childless);
                    continue;
                }
                let record = self.place_child(&parent, child.header, child_hash, child.sequence);
                staged.delta.update(record.clone());
                let (_, reorg) = self.settle(staged, record, events)?;
                if reorg.is_some() && fork.is_none() {
                    *fork = reorg;
                }
                promoted.push(child_hash);
                worklist.push(child_hash);
            }
        }
        if !promoted.is_empty() {
            log_debug!(
                "promoted {} orphan(s) below {}",
                promoted.len(),
                hash256_to_hex(&root)
            );
        }
        Ok(promoted)
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Result<IndexedHeader, ChainError> {
        self.store
            .get_by_hash(hash)?
            .ok_or_else(|| ChainError::header_not_found(hash))
    }

    pub fn header_by_height(&self, height: i32) -> Result<IndexedHeader, ChainError> {
        self.store
            .get_by_height_on_longest(height)?
            .ok_or_else(|| ChainError::HeaderNotFound(format!("at height {height}")))
    }

    /// Headers from `from` back to `to`, both inclusive, newest first.
    pub fn ancestors(&self, from: &Hash256, to: &Hash256) -> Result<Vec<IndexedHeader>, ChainError> {
        self.store.read(|reader| {
            let target = reader
                .get_by_hash(to)?
                .ok_or_else(|| ChainError::header_not_found(to))?;
            let mut current = reader
                .get_by_hash(from)?
                .ok_or_else(|| ChainError::header_not_found(from))?;
            let not_ancestor = || ChainError::AncestorNotFound {
                from: *from,
                ancestor: *to,
            };
            if target.is_orphan() || current.is_orphan() || current.height < target.height {
                return Err(not_ancestor());
            }

            let mut out = Vec::with_capacity((current.height - target.height + 1) as usize);
            loop {
                if current.hash == target.hash {
                    out.push(current);
                    return Ok(out);
                }
                if current.height <= target.height {
                    return Err(not_ancestor());
                }
                let parent = *current.prev_hash();
                out.push(current);
                current = reader.get_by_hash(&parent)?.ok_or_else(not_ancestor)?;
            }
        })
    }

    /// The highest header that is an ancestor of (or equal to) every input.
    pub fn lowest_common_ancestor(&self, hashes: &[Hash256]) -> Result<IndexedHeader, ChainError> {
        if hashes.is_empty() {
            return Err(ChainError::EmptyHashList);
        }
        self.store.read(|reader| {
            let mut cursors = Vec::with_capacity(hashes.len());
            for hash in hashes {
                let record = reader
                    .get_by_hash(hash)?
                    .ok_or_else(|| ChainError::header_not_found(hash))?;
                if record.is_orphan() {
                    return Err(ChainError::NoCommonAncestor);
                }
                cursors.push(record);
            }

            let step = |record: &IndexedHeader| -> Result<IndexedHeader, ChainError> {
                reader
                    .get_by_hash(record.prev_hash())?
                    .ok_or(ChainError::NoCommonAncestor)
            };

            let min_height = cursors.iter().map(|r| r.height).min().unwrap_or(0);
            for cursor in cursors.iter_mut() {
                while cursor.height > min_height {
                    *cursor = step(cursor)?;
                }
            }
            loop {
                let first = cursors[0].hash;
                if cursors.iter().all(|cursor| cursor.hash == first) {
                    return Ok(cursors.swap_remove(0));
                }
                if cursors[0].height == 0 {
                    return Err(ChainError::NoCommonAncestor);
                }
                for cursor in cursors.iter_mut() {
                    *cursor = step(cursor)?;
                }
            }
        })
    }

    /// Every record without children, in any state.
    pub fn tips(&self) -> Result<Vec<IndexedHeader>, ChainError> {
        Ok(self.store.tips()?)
    }

    pub fn tip_of_longest(&self) -> Result<IndexedHeader, ChainError> {
        Ok(self.store.get_tip_of_longest()?)
    }

    pub fn count(&self) -> Result<u64, ChainError> {
        Ok(self.store.count()?)
    }

    pub fn exists(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.store.exists(hash)?)
    }

    pub fn stale_backwards_from(&self, hash: &Hash256) -> Result<Vec<IndexedHeader>, ChainError> {
        self.store.get_stale_backwards_from(hash)
    }

    pub fn range_on_longest(
        &self,
        from_height: i32,
        to_height: i32,
    ) -> Result<Vec<IndexedHeader>, ChainError> {
        self.store.get_range_on_longest(from_height, to_height)
    }

    /// Longest-chain hashes at tip, tip-1, tip-2, tip-4, tip-8, … doubling
    /// the distance each time, always ending with genesis.
    pub fn block_locator(&self) -> Result<Vec<Hash256>, ChainError> {
        self.store.read(|reader| {
            let tip = reader.get_tip_of_longest()?;
            let mut locator = Vec::new();
            let mut back: i32 = 0;
            loop {
                let height = tip.height.saturating_sub(back).max(0);
                if let Some(hash) = reader.hash_at_height(height)? {
                    locator.push(hash);
                }
                if height == 0 {
                    break;
                }
                back = if back == 0 { 1 } else { back.saturating_mul(2) };
            }
            Ok(locator)
        })
    }
}

enum AdmitError {
    Invalid(&'static str),
    Store(StoreError),
}

impl From<StoreError> for AdmitError {
    fn from(err: StoreError) -> Self {
        AdmitError::Store(err)
    }
}
