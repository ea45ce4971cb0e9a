mod common;

use std::sync::Arc;

use common::*;
use headerd_chainstate::{ChainError, ChainOperation, HeaderState, Placement};
use headerd_pow::work;

#[test]
fn extend_longest() {
    let (engine, events) = memory_engine();
    let g = genesis();
    let a = mine(&g, 1);

    let outcome = engine.add_header(&a).expect("add A");
    assert_eq!(outcome.placement, Placement::Extended);

    let record = engine.header_by_hash(&a.hash()).expect("A stored");
    let genesis_record = engine.header_by_hash(&g.hash()).expect("G stored");
    assert_eq!(record.state, HeaderState::LongestChain);
    assert_eq!(record.height, 1);
    assert_eq!(record.chainwork, genesis_record.chainwork + work(a.bits));
    assert_eq!(engine.tip_of_longest().expect("tip").hash, a.hash());

    let events = events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, ChainOperation::Add);
    assert_eq!(events[0].header.hash, a.hash());
    assert_invariants(&engine);
}

#[test]
fn orphan_then_parent() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    let a = mine(&g, 1);
    let b = mine(&a, 2);

    let outcome = engine.add_header(&b).expect("add B");
    assert_eq!(outcome.placement, Placement::Orphan);
    let orphan = engine.header_by_hash(&b.hash()).expect("B stored");
    assert_eq!(orphan.state, HeaderState::Orphan);
    assert_eq!(orphan.height, -1);
    assert_invariants(&engine);

    let outcome = engine.add_header(&a).expect("add A");
    assert_eq!(outcome.placement, Placement::Extended);
    assert_eq!(outcome.promoted, vec![b.hash()]);

    let a_record = engine.header_by_hash(&a.hash()).expect("A");
    let b_record = engine.header_by_hash(&b.hash()).expect("B");
    assert_eq!(a_record.state, HeaderState::LongestChain);
    assert_eq!(b_record.state, HeaderState::LongestChain);
    assert_eq!(b_record.height, 2);
    assert_eq!(engine.tip_of_longest().expect("tip").hash, b.hash());
    assert_invariants(&engine);
}

#[test]
fn orphan_chain_cascades() {
    let (engine, _events) = memory_engine();
    let chain = mine_chain(&genesis(), 5, 10);

    for header in chain[1..].iter().rev() {
        let outcome = engine.add_header(header).expect("orphan");
        assert_eq!(outcome.placement, Placement::Orphan);
    }
    assert_invariants(&engine);

    let outcome = engine.add_header(&chain[0]).expect("root");
    assert_eq!(outcome.promoted.len(), 4);
    assert_eq!(engine.tip_of_longest().expect("tip").height, 5);
    assert_invariants(&engine);
}

#[test]
fn fork_without_reorg() {
    let (engine, events) = memory_engine();
    let g = genesis();
    let a = mine(&g, 1);
    let b = mine(&a, 2);
    engine.add_headers(&[a, b]).expect("A, B");
    events.take();

    let a_prime = mine(&g, 101);
    let outcome = engine.add_header(&a_prime).expect("A'");
    assert_eq!(outcome.placement, Placement::Stale);
    assert_eq!(
        engine.header_by_hash(&a_prime.hash()).expect("A'").state,
        HeaderState::Stale
    );
    assert_eq!(engine.tip_of_longest().expect("tip").hash, b.hash());
    assert!(events.take().is_empty());
    assert_invariants(&engine);
}

#[test]
fn reorg_onto_heavier_branch() {
    let (engine, events) = memory_engine();
    let g = genesis();
    let a = mine(&g, 1);
    let b = mine(&a, 2);
    let a_prime = mine(&g, 101);
    engine.add_headers(&[a, b, a_prime]).expect("setup");
    events.take();

    let b_prime = mine(&a_prime, 102);
    let c_prime = mine(&b_prime, 103);
    let outcome = engine.add_header(&b_prime).expect("B'");
    assert_eq!(outcome.placement, Placement::Stale);
    let outcome = engine.add_header(&c_prime).expect("C'");
    assert_eq!(outcome.placement, Placement::Reorganized { fork_height: 0 });

    for stale in [a, b] {
        assert_eq!(
            engine.header_by_hash(&stale.hash()).expect("old").state,
            HeaderState::Stale
        );
    }
    for longest in [a_prime, b_prime, c_prime] {
        assert_eq!(
            engine.header_by_hash(&longest.hash()).expect("new").state,
            HeaderState::LongestChain
        );
    }
    assert_eq!(engine.tip_of_longest().expect("tip").hash, c_prime.hash());
    assert_eq!(engine.header_by_height(2).expect("h2").hash, b_prime.hash());

    let events = events.take();
    assert!(events
        .iter()
        .any(|e| e.operation == ChainOperation::Reorg && e.header.hash == c_prime.hash()));
    assert_invariants(&engine);
}

#[test]
fn reorg_to_shorter_height_clears_old_heights() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    let main = mine_chain(&g, 3, 1);
    engine.add_headers(&main).expect("main");

    // Same height, but the branch carries a harder target.
    let mut hard = mine(&main[0], 200);
    hard.bits = 0x1f7f_ffff;
    hard.nonce = 0;
    while !headerd_pow::proof_of_work_valid(&hard) {
        hard.nonce += 1;
    }
    let outcome = engine.add_header(&hard).expect("hard");
    assert_eq!(outcome.placement, Placement::Reorganized { fork_height: 1 });
    assert_eq!(engine.tip_of_longest().expect("tip").height, 2);
    assert!(matches!(
        engine.header_by_height(3),
        Err(ChainError::HeaderNotFound(_))
    ));
    assert_invariants(&engine);
}

#[test]
fn known_header_is_noop() {
    let (engine, events) = memory_engine();
    let a = mine(&genesis(), 1);
    engine.add_header(&a).expect("first");
    events.take();
    let before = snapshot(&engine);

    let outcome = engine.add_header(&a).expect("second");
    assert_eq!(outcome.placement, Placement::Known);
    assert_eq!(snapshot(&engine), before);
    assert!(events.take().is_empty());
}

#[test]
fn invalid_header_aborts_whole_batch() {
    let (engine, events) = memory_engine();
    let chain = mine_chain(&genesis(), 3, 1);
    let mut bad = chain[2];
    while headerd_pow::proof_of_work_valid(&bad) {
        bad.nonce += 1;
    }

    let err = engine
        .add_headers(&[chain[0], chain[1], bad])
        .expect_err("bad pow");
    match err {
        ChainError::InvalidHeader { index, .. } => assert_eq!(index, 2),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(engine.count().expect("count"), 1);
    assert!(!engine.exists(&chain[0].hash()).expect("exists"));
    assert!(events.take().is_empty());
}

#[test]
fn rejects_future_timestamp() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    let now = (test_clock())();
    let late = mine_at(&g, 1, (now + 2 * 60 * 60 + 1) as u32);
    assert!(matches!(
        engine.add_header(&late),
        Err(ChainError::InvalidHeader { .. })
    ));
    let edge = mine_at(&g, 2, (now + 2 * 60 * 60) as u32);
    assert_eq!(
        engine.add_header(&edge).expect("edge").placement,
        Placement::Extended
    );
}

#[test]
fn rejects_timestamp_at_median_time_past() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    let chain = mine_chain(&g, 11, 1);
    engine.add_headers(&chain).expect("chain");

    // Median of the last 11 is the sixth-newest timestamp.
    let median = chain[5].time;
    let tip = chain[10];
    let early = mine_at(&tip, 99, median);
    assert!(matches!(
        engine.add_header(&early),
        Err(ChainError::InvalidHeader { .. })
    ));
    let ok = mine_at(&tip, 100, median + 1);
    assert_eq!(engine.add_header(&ok).expect("ok").placement, Placement::Extended);
}

#[test]
fn orphan_failing_median_time_is_dropped_when_parent_arrives() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    let a = mine(&g, 1);
    let early = mine_at(&a, 2, g.time);
    let early_child = mine(&early, 3);
    engine.add_headers(&[early, early_child]).expect("orphans");
    assert_eq!(engine.count().expect("count"), 3);

    let outcome = engine.add_header(&a).expect("parent");
    assert_eq!(outcome.placement, Placement::Extended);
    assert!(outcome.promoted.is_empty());
    assert!(!engine.exists(&early.hash()).expect("exists"));
    assert_eq!(
        engine.header_by_hash(&early_child.hash()).expect("child").state,
        HeaderState::Orphan
    );
    assert_eq!(engine.count().expect("count"), 3);

    let mut tips: Vec<_> = engine.tips().expect("tips").iter().map(|t| t.hash).collect();
    tips.sort();
    let mut expected = vec![a.hash(), early_child.hash()];
    expected.sort();
    assert_eq!(tips, expected);
    assert_invariants(&engine);

    // Resending it now is a plain rejection.
    assert!(matches!(
        engine.add_header(&early),
        Err(ChainError::InvalidHeader { .. })
    ));
}

#[test]
fn equal_work_branch_observed_first_wins_on_promotion() {
    let (engine, events) = memory_engine();
    let g = genesis();
    let a = mine(&g, 1);
    let b = mine(&a, 2);
    let a_prime = mine(&g, 101);
    let b_prime = mine(&a_prime, 102);

    assert_eq!(
        engine.add_header(&b_prime).expect("B'").placement,
        Placement::Orphan
    );
    engine.add_headers(&[a, b]).expect("A, B");
    events.take();

    // B' ties B on work but was observed before it.
    let outcome = engine.add_header(&a_prime).expect("A'");
    assert_eq!(outcome.placement, Placement::Reorganized { fork_height: 0 });
    assert_eq!(outcome.promoted, vec![b_prime.hash()]);
    assert_eq!(engine.tip_of_longest().expect("tip").hash, b_prime.hash());
    for stale in [a, b] {
        assert_eq!(
            engine.header_by_hash(&stale.hash()).expect("old").state,
            HeaderState::Stale
        );
    }
    assert!(events
        .take()
        .iter()
        .any(|e| e.operation == ChainOperation::Reorg && e.header.hash == b_prime.hash()));
    assert_invariants(&engine);
}

#[test]
fn tips_ancestors_and_common_ancestor() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    let main = mine_chain(&g, 4, 1);
    let fork = mine_chain(&main[1], 1, 50);
    engine.add_headers(&main).expect("main");
    engine.add_headers(&fork).expect("fork");

    let mut tips: Vec<_> = engine.tips().expect("tips").iter().map(|t| t.hash).collect();
    tips.sort();
    let mut expected = vec![main[3].hash(), fork[0].hash()];
    expected.sort();
    assert_eq!(tips, expected);

    let ancestry = engine
        .ancestors(&main[3].hash(), &main[1].hash())
        .expect("ancestors");
    let heights: Vec<i32> = ancestry.iter().map(|r| r.height).collect();
    assert_eq!(heights, vec![4, 3, 2]);

    assert!(matches!(
        engine.ancestors(&main[3].hash(), &fork[0].hash()),
        Err(ChainError::AncestorNotFound { .. })
    ));

    let lca = engine
        .lowest_common_ancestor(&[main[3].hash(), fork[0].hash()])
        .expect("lca");
    assert_eq!(lca.hash, main[1].hash());
    let lca = engine
        .lowest_common_ancestor(&[main[2].hash()])
        .expect("single");
    assert_eq!(lca.hash, main[2].hash());
    assert!(matches!(
        engine.lowest_common_ancestor(&[]),
        Err(ChainError::EmptyHashList)
    ));

    let stale = engine
        .stale_backwards_from(&fork[0].hash())
        .expect("stale walk");
    assert_eq!(stale.len(), 1);
    assert!(engine
        .stale_backwards_from(&main[3].hash())
        .expect("longest")
        .is_empty());

    let range = engine.range_on_longest(1, 3).expect("range");
    assert_eq!(range.len(), 3);
    assert!(engine.range_on_longest(3, 9).is_err());
}

#[test]
fn block_locator_is_sparse_and_ends_at_genesis() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    let chain = mine_chain(&g, 40, 1);
    engine.add_headers(&chain).expect("chain");

    let locator = engine.block_locator().expect("locator");
    let heights: Vec<i32> = locator
        .iter()
        .map(|hash| engine.header_by_hash(hash).expect("known").height)
        .collect();
    assert_eq!(heights, vec![40, 39, 38, 36, 32, 24, 8, 0]);
    assert_eq!(locator.last(), Some(&g.hash()));
}

#[test]
fn block_locator_on_short_chains() {
    let (engine, _events) = memory_engine();
    let g = genesis();
    assert_eq!(engine.block_locator().expect("genesis only"), vec![g.hash()]);

    let chain = mine_chain(&g, 2, 1);
    engine.add_headers(&chain).expect("chain");
    assert_eq!(
        engine.block_locator().expect("locator"),
        vec![chain[1].hash(), chain[0].hash(), g.hash()]
    );
}

#[test]
fn genesis_is_seeded_once() {
    let store = Arc::new(headerd_storage::memory::MemoryStore::new());
    let (engine, _events) = engine_on(store.clone());
    engine.add_header(&mine(&genesis(), 1)).expect("add");
    drop(engine);

    let (engine, _events) = engine_on(store);
    assert_eq!(engine.count().expect("count"), 2);
    assert_eq!(engine.tip_of_longest().expect("tip").height, 1);
    assert_invariants(&engine);
}
