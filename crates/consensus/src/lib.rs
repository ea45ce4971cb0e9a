//! Consensus constants, network selection and chain parameters.

pub mod constants;
pub mod hex;
pub mod params;

pub use hex::{hash256_from_hex, hash256_to_hex, HexError};
pub use params::{chain_params, ChainParams, GenesisParams, Network};

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];
