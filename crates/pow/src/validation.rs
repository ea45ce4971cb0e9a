use headerd_consensus::{ChainParams, Hash256};
use headerd_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks `bits` against the network limit and the header hash against `bits`.
pub fn validate_pow_header(header: &BlockHeader, params: &ChainParams) -> Result<(), PowError> {
    let hash = header.hash();
    validate_pow_hash(&hash, header.bits, &params.pow_limit)
}

pub fn validate_pow_hash(hash: &Hash256, bits: u32, pow_limit: &Hash256) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }
    if target > U256::from_little_endian(pow_limit) {
        return Err(PowError::InvalidBits("pow target above limit"));
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

/// Hash-as-integer is at most the header's own target.
pub fn proof_of_work_valid(header: &BlockHeader) -> bool {
    match compact_to_u256(header.bits) {
        Ok(target) if !target.is_zero() => U256::from_little_endian(&header.hash()) <= target,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headerd_consensus::{chain_params, Network};

    #[test]
    fn genesis_headers_satisfy_pow() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = chain_params(network);
            let genesis = BlockHeader::genesis(&params.genesis);
            assert!(proof_of_work_valid(&genesis));
            assert_eq!(validate_pow_header(&genesis, &params), Ok(()));
        }
    }

    #[test]
    fn regtest_bits_rejected_on_mainnet() {
        let main = chain_params(Network::Mainnet);
        let regtest = chain_params(Network::Regtest);
        let genesis = BlockHeader::genesis(&regtest.genesis);
        assert_eq!(
            validate_pow_header(&genesis, &main),
            Err(PowError::InvalidBits("pow target above limit"))
        );
    }

    #[test]
    fn tampered_nonce_fails() {
        let params = chain_params(Network::Mainnet);
        let mut genesis = BlockHeader::genesis(&params.genesis);
        genesis.nonce = genesis.nonce.wrapping_add(1);
        assert!(!proof_of_work_valid(&genesis));
        assert_eq!(
            validate_pow_header(&genesis, &params),
            Err(PowError::HashMismatch)
        );
    }
}
