//! Chain events delivered to listeners after a batch commits.

use crate::record::IndexedHeader;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainOperation {
    Add,
    Reorg,
}

impl ChainOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainOperation::Add => "ADD",
            ChainOperation::Reorg => "REORG",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEvent {
    pub operation: ChainOperation,
    pub header: IndexedHeader,
}

/// Receives events in commit order. Called with the engine's write lock held,
/// so implementations must not block or call back into the engine's writer.
pub trait ChainListener: Send + Sync {
    fn on_chain_event(&self, event: &ChainEvent);
}

pub struct NoopListener;

impl ChainListener for NoopListener {
    fn on_chain_event(&self, _event: &ChainEvent) {}
}
