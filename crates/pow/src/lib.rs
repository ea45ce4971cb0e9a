//! Compact targets, header work and proof-of-work checks.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, compact_to_u256, work, CompactError};
pub use validation::{proof_of_work_valid, validate_pow_header, PowError};
