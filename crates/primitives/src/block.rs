//! The 80-byte block header.

use headerd_consensus::constants::BLOCK_HEADER_SIZE;
use headerd_consensus::{hash256_to_hex, GenesisParams, Hash256, ZERO_HASH};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn genesis(params: &GenesisParams) -> Self {
        Self {
            version: params.version,
            prev_block: ZERO_HASH,
            merkle_root: params.merkle_root,
            time: params.time,
            bits: params.bits,
            nonce: params.nonce,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block == ZERO_HASH
    }

    pub fn consensus_encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(BLOCK_HEADER_SIZE);
        self.encode_into(&mut encoder);
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    /// Decodes exactly 80 bytes; shorter or longer input is malformed.
    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != BLOCK_HEADER_SIZE {
            return Err(DecodeError::InvalidData("block header must be 80 bytes"));
        }
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    /// Hash as reversed-byte hex, the form block explorers show.
    pub fn display_hash(&self) -> String {
        hash256_to_hex(&self.hash())
    }
}
