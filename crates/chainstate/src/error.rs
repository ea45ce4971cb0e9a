use std::fmt;

use headerd_consensus::{hash256_to_hex, Hash256};
use headerd_storage::StoreError;

/// Coarse error classes; transports map these onto status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    NotFound,
    Conflict,
    Unauthorized,
    InvalidHeader,
    Storage,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Malformed => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidHeader | ErrorKind::Storage => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    HeaderNotFound(String),
    AncestorNotFound { from: Hash256, ancestor: Hash256 },
    NoCommonAncestor,
    MerkleRootNotFound(String),
    MerkleRootNotInLongestChain(String),
    InvalidBatchSize(i64),
    EmptyMerkleRootList,
    EmptyHashList,
    InvalidHash(String),
    InvalidHeader {
        index: usize,
        hash: Hash256,
        reason: String,
    },
    Storage(StoreError),
}

impl ChainError {
    pub fn code(&self) -> &'static str {
        match self {
            ChainError::HeaderNotFound(_) => "ErrHeaderNotFound",
            ChainError::AncestorNotFound { .. } => "ErrAncestorNotFound",
            ChainError::NoCommonAncestor => "ErrCommonAncestorNotFound",
            ChainError::MerkleRootNotFound(_) => "ErrMerkleRootNotFound",
            ChainError::MerkleRootNotInLongestChain(_) => "ErrMerkleRootNotInLongestChain",
            ChainError::InvalidBatchSize(_) => "ErrInvalidBatchSize",
            ChainError::EmptyMerkleRootList => "ErrEmptyMerkleRootList",
            ChainError::EmptyHashList => "ErrEmptyHashList",
            ChainError::InvalidHash(_) => "ErrInvalidHash",
            ChainError::InvalidHeader { .. } => "ErrInvalidHeader",
            ChainError::Storage(_) => "ErrStorage",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::InvalidBatchSize(_)
            | ChainError::EmptyMerkleRootList
            | ChainError::EmptyHashList
            | ChainError::InvalidHash(_) => ErrorKind::Malformed,
            ChainError::HeaderNotFound(_)
            | ChainError::AncestorNotFound { .. }
            | ChainError::NoCommonAncestor
            | ChainError::MerkleRootNotFound(_) => ErrorKind::NotFound,
            ChainError::MerkleRootNotInLongestChain(_) => ErrorKind::Conflict,
            ChainError::InvalidHeader { .. } => ErrorKind::InvalidHeader,
            ChainError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn header_not_found(hash: &Hash256) -> Self {
        ChainError::HeaderNotFound(hash256_to_hex(hash))
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::HeaderNotFound(what) => write!(f, "header {what} not found"),
            ChainError::AncestorNotFound { from, ancestor } => write!(
                f,
                "{} is not an ancestor of {}",
                hash256_to_hex(ancestor),
                hash256_to_hex(from)
            ),
            ChainError::NoCommonAncestor => write!(f, "headers share no common ancestor"),
            ChainError::MerkleRootNotFound(root) => write!(f, "merkle root {root} not found"),
            ChainError::MerkleRootNotInLongestChain(root) => {
                write!(f, "merkle root {root} is not in the longest chain")
            }
            ChainError::InvalidBatchSize(size) => {
                write!(f, "batch size must be a non-negative integer, got {size}")
            }
            ChainError::EmptyMerkleRootList => write!(f, "merkle root list is empty"),
            ChainError::EmptyHashList => write!(f, "hash list is empty"),
            ChainError::InvalidHash(raw) => write!(f, "invalid hash '{raw}'"),
            ChainError::InvalidHeader {
                index,
                hash,
                reason,
            } => write!(
                f,
                "invalid header {} at batch index {index}: {reason}",
                hash256_to_hex(hash)
            ),
            ChainError::Storage(err) => write!(f, "storage failure: {err}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Storage(err)
    }
}
