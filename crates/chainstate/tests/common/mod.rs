#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use headerd_chainstate::{
    ChainEngine, ChainEvent, ChainListener, ChainStore, HeaderState, IndexedHeader,
};
use headerd_consensus::{chain_params, ChainParams, Hash256, Network};
use headerd_pow::proof_of_work_valid;
use headerd_primitives::block::BlockHeader;
use headerd_primitives::sha256;
use headerd_storage::memory::MemoryStore;
use headerd_storage::{Column, KeyValueStore};
use primitive_types::U256;

#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ChainEvent>>,
}

impl EventLog {
    pub fn take(&self) -> Vec<ChainEvent> {
        std::mem::take(&mut *self.events.lock().expect("events"))
    }
}

impl ChainListener for EventLog {
    fn on_chain_event(&self, event: &ChainEvent) {
        self.events.lock().expect("events").push(event.clone());
    }
}

pub fn regtest() -> ChainParams {
    chain_params(Network::Regtest)
}

pub fn genesis() -> BlockHeader {
    BlockHeader::genesis(&regtest().genesis)
}

/// A fixed "now" comfortably after every test header.
pub fn test_clock() -> headerd_chainstate::Clock {
    let now = genesis().time as i64 + 365 * 24 * 60 * 60;
    Arc::new(move || now)
}

pub fn engine_on<S: KeyValueStore>(store: Arc<S>) -> (ChainEngine<S>, Arc<EventLog>) {
    let params = regtest();
    let chain = ChainStore::open(store, &params).expect("open chain store");
    let events = Arc::new(EventLog::default());
    let engine = ChainEngine::with_clock(chain, params, events.clone(), test_clock());
    (engine, events)
}

pub fn memory_engine() -> (ChainEngine<MemoryStore>, Arc<EventLog>) {
    engine_on(Arc::new(MemoryStore::new()))
}

/// Mines a regtest child of `parent`; `tag` keeps siblings distinct.
pub fn mine(parent: &BlockHeader, tag: u32) -> BlockHeader {
    mine_at(parent, tag, parent.time + 600)
}

pub fn mine_at(parent: &BlockHeader, tag: u32, time: u32) -> BlockHeader {
    let mut header = BlockHeader {
        version: 1,
        prev_block: parent.hash(),
        merkle_root: sha256(&tag.to_le_bytes()),
        time,
        bits: 0x207f_ffff,
        nonce: 0,
    };
    while !proof_of_work_valid(&header) {
        header.nonce += 1;
    }
    header
}

/// `len` headers extending `from`, tags starting at `first_tag`.
pub fn mine_chain(from: &BlockHeader, len: usize, first_tag: u32) -> Vec<BlockHeader> {
    let mut out = Vec::with_capacity(len);
    let mut parent = *from;
    for i in 0..len {
        let header = mine(&parent, first_tag + i as u32);
        out.push(header);
        parent = header;
    }
    out
}

pub fn all_records<S: KeyValueStore>(engine: &ChainEngine<S>) -> HashMap<Hash256, IndexedHeader> {
    engine
        .store()
        .backend()
        .scan_prefix(Column::Header, &[])
        .expect("scan headers")
        .into_iter()
        .map(|(key, value)| {
            let hash: Hash256 = key.as_slice().try_into().expect("hash key");
            (hash, IndexedHeader::decode(hash, &value).expect("decode"))
        })
        .collect()
}

/// Order-independent view of chain state.
pub fn snapshot<S: KeyValueStore>(
    engine: &ChainEngine<S>,
) -> BTreeMap<Hash256, (i32, HeaderState, U256)> {
    all_records(engine)
        .into_iter()
        .map(|(hash, record)| (hash, (record.height, record.state, record.chainwork)))
        .collect()
}

/// Checks the structural invariants that must hold after every commit.
pub fn assert_invariants<S: KeyValueStore>(engine: &ChainEngine<S>) {
    let records = all_records(engine);
    let zero = [0u8; 32];

    let genesis: Vec<_> = records
        .values()
        .filter(|r| r.header.prev_block == zero)
        .collect();
    assert_eq!(genesis.len(), 1, "exactly one genesis");
    assert_eq!(genesis[0].height, 0);

    for record in records.values() {
        assert!(proof_of_work_valid(&record.header), "stored header has pow");
        let parent = records.get(&record.header.prev_block);
        match record.state {
            HeaderState::Orphan => assert_eq!(record.height, -1),
            _ if record.header.prev_block == zero => {}
            _ => {
                let parent = parent.expect("placed header has parent");
                assert!(!parent.is_orphan());
                assert_eq!(record.height, parent.height + 1);
                assert_eq!(record.chainwork, parent.chainwork + record.work());
            }
        }
    }

    let tip = engine.tip_of_longest().expect("tip");
    assert!(tip.is_longest());
    let mut on_path = 0;
    let mut cursor = Some(tip.clone());
    while let Some(record) = cursor {
        assert!(record.is_longest(), "path from tip is longest");
        let at_height = engine.header_by_height(record.height).expect("height index");
        assert_eq!(at_height.hash, record.hash);
        on_path += 1;
        cursor = records.get(&record.header.prev_block).cloned();
    }
    let longest = records.values().filter(|r| r.is_longest()).count();
    assert_eq!(longest, on_path, "longest records are exactly the tip's ancestry");
    assert_eq!(on_path as i32, tip.height + 1);

    let has_child: std::collections::HashSet<Hash256> =
        records.values().map(|r| r.header.prev_block).collect();
    let mut expected_tips: Vec<Hash256> = records
        .keys()
        .filter(|hash| !has_child.contains(*hash))
        .copied()
        .collect();
    let mut tips: Vec<Hash256> = engine.tips().expect("tips").iter().map(|r| r.hash).collect();
    expected_tips.sort();
    tips.sort();
    assert_eq!(tips, expected_tips, "tip index");

    for record in records.values().filter(|r| !r.is_orphan()) {
        assert!(tip.chainwork >= record.chainwork, "longest tip has most work");
    }
    assert_eq!(engine.count().expect("count"), records.len() as u64);
}
