//! Header chain state: persisted records, the admission engine, and merkle
//! root verification.

pub mod engine;
pub mod error;
pub mod events;
pub mod merkle;
pub mod migrations;
pub mod pending;
pub mod record;
pub mod store;

pub use engine::{AddOutcome, ChainEngine, Clock, Placement};
pub use error::{ChainError, ErrorKind};
pub use events::{ChainEvent, ChainListener, ChainOperation, NoopListener};
pub use merkle::{
    merkle_root_page, verify_merkle_roots, ChainTracker, Confirmation, MerkleRootItem,
    MerkleRootPage, MerkleVerification,
};
pub use record::{HeaderState, IndexedHeader};
pub use store::ChainStore;
