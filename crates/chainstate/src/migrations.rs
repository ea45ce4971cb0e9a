//! Ordered schema migrations, applied when a store is opened.
//!
//! Each step runs in its own atomic batch together with the version bump, so
//! an interrupted upgrade resumes at the first unapplied step.

use headerd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::record::IndexedHeader;
use crate::store::{
    child_key, merkle_key, EMPTY, META_HEADER_COUNT, META_NEXT_SEQUENCE, META_SCHEMA_VERSION,
};

struct Migration {
    version: u32,
    name: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initialize_counters",
    },
    Migration {
        version: 2,
        name: "rebuild_secondary_indexes",
    },
];

pub const SCHEMA_VERSION: u32 = 2;

pub fn schema_version<S: KeyValueStore + ?Sized>(store: &S) -> Result<u32, StoreError> {
    match store.get(Column::Meta, META_SCHEMA_VERSION)? {
        Some(bytes) => {
            let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::Corrupt("schema version must be 4 bytes".to_string())
            })?;
            Ok(u32::from_le_bytes(raw))
        }
        None => Ok(0),
    }
}

/// Brings `store` up to [`SCHEMA_VERSION`]. Returns the number of steps run.
pub fn migrate<S: KeyValueStore + ?Sized>(store: &S) -> Result<usize, StoreError> {
    let current = schema_version(store)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Corrupt(format!(
            "schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let mut batch = WriteBatch::new();
        match migration.version {
            1 => initialize_counters(store, &mut batch)?,
            2 => rebuild_secondary_indexes(store, &mut batch)?,
            other => {
                return Err(StoreError::Backend(format!("no migration step {other}")));
            }
        }
        batch.put(
            Column::Meta,
            META_SCHEMA_VERSION,
            migration.version.to_le_bytes(),
        );
        store.write_batch(&batch)?;
        headerd_log::log_info!(
            "applied schema migration {} ({})",
            migration.version,
            migration.name
        );
        applied += 1;
    }
    Ok(applied)
}

fn initialize_counters<S: KeyValueStore + ?Sized>(
    store: &S,
    batch: &mut WriteBatch,
) -> Result<(), StoreError> {
    if store.get(Column::Meta, META_HEADER_COUNT)?.is_none() {
        batch.put(Column::Meta, META_HEADER_COUNT, 0u64.to_le_bytes());
    }
    if store.get(Column::Meta, META_NEXT_SEQUENCE)?.is_none() {
        batch.put(Column::Meta, META_NEXT_SEQUENCE, 0u64.to_le_bytes());
    }
    Ok(())
}

/// Recomputes child, merkle and tip indexes plus the header count from the
/// header records themselves.
fn rebuild_secondary_indexes<S: KeyValueStore + ?Sized>(
    store: &S,
    batch: &mut WriteBatch,
) -> Result<(), StoreError> {
    let mut records = Vec::new();
    for (key, value) in store.scan_prefix(Column::Header, EMPTY)? {
        let hash = key
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corrupt("header key must be 32 bytes".to_string()))?;
        records.push(IndexedHeader::decode(hash, &value)?);
    }

    let mut max_sequence = None;
    let mut parents = std::collections::HashSet::new();
    for record in &records {
        if !record.header.is_genesis() {
            parents.insert(record.header.prev_block);
            batch.put(
                Column::ChildIndex,
                child_key(&record.header.prev_block, &record.hash),
                EMPTY,
            );
        }
        batch.put(
            Column::MerkleIndex,
            merkle_key(&record.header.merkle_root, &record.hash),
            EMPTY,
        );
        max_sequence = max_sequence.max(Some(record.sequence));
    }
    for record in &records {
        if !parents.contains(&record.hash) {
            batch.put(Column::TipIndex, record.hash, EMPTY);
        }
    }

    batch.put(
        Column::Meta,
        META_HEADER_COUNT,
        (records.len() as u64).to_le_bytes(),
    );
    if let Some(max_sequence) = max_sequence {
        batch.put(
            Column::Meta,
            META_NEXT_SEQUENCE,
            (max_sequence + 1).to_le_bytes(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use headerd_storage::memory::MemoryStore;

    #[test]
    fn fresh_store_reaches_current_version() {
        let store = MemoryStore::new();
        assert_eq!(migrate(&store), Ok(MIGRATIONS.len()));
        assert_eq!(schema_version(&store), Ok(SCHEMA_VERSION));
        assert_eq!(
            store.get(Column::Meta, META_HEADER_COUNT),
            Ok(Some(0u64.to_le_bytes().to_vec()))
        );
        assert_eq!(migrate(&store), Ok(0));
    }

    #[test]
    fn newer_schema_is_refused() {
        let store = MemoryStore::new();
        store
            .put(
                Column::Meta,
                META_SCHEMA_VERSION,
                &(SCHEMA_VERSION + 1).to_le_bytes(),
            )
            .expect("put");
        assert!(matches!(migrate(&store), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn last_migration_matches_schema_version() {
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(SCHEMA_VERSION));
    }
}
