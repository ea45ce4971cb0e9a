mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use headerd_chainstate::ChainError;
use headerd_storage::memory::MemoryStore;
use headerd_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

/// Fails the next `failures` batch writes, then behaves.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl KeyValueStore for FlakyStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("injected failure".to_string()));
        }
        self.inner.write_batch(batch)
    }
}

#[test]
fn single_commit_failure_is_retried() {
    let store = Arc::new(FlakyStore::default());
    let (engine, events) = engine_on(store.clone());
    let chain = mine_chain(&genesis(), 3, 1);

    store.failures.store(1, Ordering::SeqCst);
    engine.add_headers(&chain).expect("second attempt succeeds");
    assert_eq!(engine.tip_of_longest().expect("tip").height, 3);
    assert_eq!(events.take().len(), 3);
    assert_invariants(&engine);
}

#[test]
fn repeated_commit_failure_leaves_state_untouched() {
    let store = Arc::new(FlakyStore::default());
    let (engine, events) = engine_on(store.clone());
    let chain = mine_chain(&genesis(), 3, 1);

    store.failures.store(2, Ordering::SeqCst);
    assert!(matches!(
        engine.add_headers(&chain),
        Err(ChainError::Storage(StoreError::Backend(_)))
    ));
    assert_eq!(engine.count().expect("count"), 1);
    assert!(events.take().is_empty());

    engine.add_headers(&chain).expect("healthy again");
    assert_eq!(engine.count().expect("count"), 4);
    assert_invariants(&engine);
}
