mod common;

use std::sync::Arc;

use common::*;
use headerd_chainstate::HeaderState;
use headerd_storage::fjall::FjallStore;
use headerd_storage::KeyValueStore;

#[test]
fn chain_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let g = genesis();
    let main = mine_chain(&g, 4, 1);
    let side = mine_chain(&g, 1, 100);
    let orphan = mine(&mine(&main[3], 300), 301);

    {
        let store = Arc::new(FjallStore::open(dir.path()).expect("open"));
        let (engine, _events) = engine_on(store.clone());
        engine.add_headers(&main).expect("main");
        engine.add_headers(&side).expect("side");
        engine.add_header(&orphan).expect("orphan");
        store.flush().expect("flush");
    }

    let store = Arc::new(FjallStore::open(dir.path()).expect("reopen"));
    let (engine, _events) = engine_on(store);
    assert_eq!(engine.count().expect("count"), 7);
    assert_eq!(engine.tip_of_longest().expect("tip").hash, main[3].hash());
    assert_eq!(
        engine.header_by_hash(&side[0].hash()).expect("side").state,
        HeaderState::Stale
    );
    assert_eq!(
        engine.header_by_hash(&orphan.hash()).expect("orphan").state,
        HeaderState::Orphan
    );
    assert_eq!(engine.block_locator().expect("locator").len(), 4);
    assert_invariants(&engine);
}
