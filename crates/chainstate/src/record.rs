//! The persisted form of a header plus its placement in the chain graph.

use headerd_consensus::constants::BLOCK_HEADER_SIZE;
use headerd_consensus::{hash256_to_hex, Hash256};
use headerd_primitives::block::BlockHeader;
use headerd_storage::StoreError;
use primitive_types::U256;

/// 80 header bytes, height, chainwork, state, sequence.
pub const RECORD_SIZE: usize = BLOCK_HEADER_SIZE + 4 + 32 + 1 + 8;

/// Height assigned to records whose ancestry is not yet known.
pub const ORPHAN_HEIGHT: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeaderState {
    LongestChain,
    Stale,
    Orphan,
}

impl HeaderState {
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderState::LongestChain => "LONGEST_CHAIN",
            HeaderState::Stale => "STALE",
            HeaderState::Orphan => "ORPHAN",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            HeaderState::LongestChain => 0,
            HeaderState::Stale => 1,
            HeaderState::Orphan => 2,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(HeaderState::LongestChain),
            1 => Some(HeaderState::Stale),
            2 => Some(HeaderState::Orphan),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedHeader {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: i32,
    pub chainwork: U256,
    pub state: HeaderState,
    /// Order of first observation; earlier wins a chainwork tie.
    pub sequence: u64,
}

impl IndexedHeader {
    pub fn orphan(header: BlockHeader, hash: Hash256, sequence: u64) -> Self {
        Self {
            header,
            hash,
            height: ORPHAN_HEIGHT,
            chainwork: U256::zero(),
            state: HeaderState::Orphan,
            sequence,
        }
    }

    pub fn prev_hash(&self) -> &Hash256 {
        &self.header.prev_block
    }

    pub fn is_orphan(&self) -> bool {
        self.state == HeaderState::Orphan
    }

    pub fn is_longest(&self) -> bool {
        self.state == HeaderState::LongestChain
    }

    pub fn work(&self) -> U256 {
        headerd_pow::work(self.header.bits)
    }

    pub fn display_hash(&self) -> String {
        hash256_to_hex(&self.hash)
    }

    /// True if `self` should replace `other` as the longest tip.
    pub fn beats(&self, other: &IndexedHeader) -> bool {
        self.chainwork > other.chainwork
            || (self.chainwork == other.chainwork && self.sequence < other.sequence)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_SIZE);
        out.extend_from_slice(&self.header.consensus_encode());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.chainwork.to_big_endian());
        out.push(self.state.to_u8());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out
    }

    pub fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != RECORD_SIZE {
            return Err(StoreError::Corrupt(format!(
                "header record {} has {} bytes",
                hash256_to_hex(&hash),
                bytes.len()
            )));
        }
        let header = BlockHeader::consensus_decode(&bytes[..BLOCK_HEADER_SIZE])
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let mut offset = BLOCK_HEADER_SIZE;
        let height = i32::from_le_bytes(take(bytes, &mut offset));
        let chainwork = U256::from_big_endian(&take::<32>(bytes, &mut offset));
        let [state] = take::<1>(bytes, &mut offset);
        let state = HeaderState::from_u8(state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown header state {state}")))?;
        let sequence = u64::from_le_bytes(take(bytes, &mut offset));
        Ok(Self {
            header,
            hash,
            height,
            chainwork,
            state,
            sequence,
        })
    }
}

fn take<const N: usize>(bytes: &[u8], offset: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[*offset..*offset + N]);
    *offset += N;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use headerd_consensus::{chain_params, Network};

    #[test]
    fn record_roundtrip_keeps_placement() {
        let params = chain_params(Network::Regtest);
        let header = BlockHeader::genesis(&params.genesis);
        let record = IndexedHeader {
            header,
            hash: header.hash(),
            height: 7,
            chainwork: U256::from(0x1234_5678u64) << 100,
            state: HeaderState::Stale,
            sequence: 42,
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(IndexedHeader::decode(record.hash, &bytes), Ok(record));
    }

    #[test]
    fn truncated_record_is_corrupt() {
        assert!(matches!(
            IndexedHeader::decode([0u8; 32], &[0u8; 10]),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn tie_goes_to_earlier_observation() {
        let params = chain_params(Network::Regtest);
        let header = BlockHeader::genesis(&params.genesis);
        let mut early = IndexedHeader::orphan(header, header.hash(), 1);
        early.chainwork = U256::from(10u64);
        let mut late = early.clone();
        late.sequence = 2;
        assert!(early.beats(&late));
        assert!(!late.beats(&early));
        late.chainwork = U256::from(11u64);
        assert!(late.beats(&early));
    }
}
