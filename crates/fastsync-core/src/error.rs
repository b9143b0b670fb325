//! Error types for fast sync.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("block not found at height {0}")] NotFound(u64),
    #[error("backend: {0}")] Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("commit height {got} does not certify height {expected}")] HeightMismatch { expected: u64, got: u64 },
    #[error("commit is for a different block id")] BlockIdMismatch,
    #[error("unknown validator index {0}")] UnknownValidator(u32),
    #[error("duplicate signature from validator {0}")] DuplicateSignature(u32),
    #[error("invalid signature from validator {0}")] InvalidSignature(u32),
    #[error("insufficient voting power: {signed} of {total}")] InsufficientVotingPower { signed: usize, total: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    #[error(transparent)] Store(#[from] StoreError),
    #[error("block rejected by application: {0}")] Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode: {0}")] Encode(String),
    #[error("decode: {0}")] Decode(String),
    #[error("unknown message type: {0:#04x}")] UnknownMessageType(u8),
    #[error("payload has {0} trailing bytes")] TrailingBytes(usize),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part size must be non-zero")] ZeroPartSize,
    #[error("expected {expected} parts, got {got}")] CountMismatch { expected: u32, got: u32 },
    #[error("part {0} out of order")] OutOfOrder(u32),
    #[error("invalid proof for part {0}")] InvalidProof(u32),
    #[error("decode: {0}")] Decode(String),
}

/// Errors surfaced by the block pool and the sync reactor.
///
/// Only fatal variants ever leave the subsystem: everything recoverable is
/// absorbed by peer removal and reassignment.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no requester to pop at height {height}")] NothingToPop { height: u64 },
    #[error("no requester holds height {height}")] MissingBlock { height: u64 },
    #[error("failed to execute committed block {height} ({hash}): {source}")]
    Execution { height: u64, hash: String, source: ExecuteError },
    #[error("failed to build part set for block {height}: {source}")]
    PartSet { height: u64, source: PartSetError },
    #[error("reactor already running")] AlreadyRunning,
}

impl SyncError {
    /// Whether this error indicates corrupted bookkeeping or a diverged
    /// application state, which must stop the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::AlreadyRunning)
    }
}
