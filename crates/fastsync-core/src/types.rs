//! Core protocol types: hashes, peer identities, headers, commits, blocks.
//!
//! A block at height `h` carries the commit certifying block `h - 1`, so a
//! block can only be verified once its successor is known.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::PartSetError;
use crate::part_set::{merkle_root, PartSet, PartSetHeader};

/// A 32-byte hash value.
///
/// Used for header hashes and commit hashes (SHA-256) and for Merkle roots
/// (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of arbitrary data.
    pub fn sha256(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque identity of a remote node, as assigned by the transport.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Verifiable identity of a block: its header hash plus the header of the
/// part set it was transmitted as.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockId {
    pub hash: Hash256,
    pub parts_header: PartSetHeader,
}

impl BlockId {
    /// The empty id referenced by the first block of a chain.
    pub fn is_zero(&self) -> bool {
        self.hash.is_zero() && self.parts_header.total == 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.parts_header)
    }
}

/// Block header.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Identifier of the chain this block belongs to.
    pub chain_id: String,
    /// Position of the block in the chain (first block is height 1).
    pub height: u64,
    /// Proposal time in Unix milliseconds.
    pub time_ms: u64,
    /// Number of transactions in the block body.
    pub num_txs: u64,
    /// Id of the previous block; zero for the first block.
    pub last_block_id: BlockId,
    /// Hash of the commit embedded in this block.
    pub last_commit_hash: Hash256,
    /// Merkle root of the transactions.
    pub data_hash: Hash256,
}

impl BlockHeader {
    /// Compute the header hash (SHA-256).
    ///
    /// Uses an explicit byte layout: len(chain_id) || chain_id || height ||
    /// time_ms || num_txs || last_block_id.hash || parts.total || parts.root ||
    /// last_commit_hash || data_hash, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(8 + self.chain_id.len() + 4 * 8 + 4 + 4 * 32);
        data.extend_from_slice(&(self.chain_id.len() as u64).to_le_bytes());
        data.extend_from_slice(self.chain_id.as_bytes());
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.time_ms.to_le_bytes());
        data.extend_from_slice(&self.num_txs.to_le_bytes());
        data.extend_from_slice(self.last_block_id.hash.as_bytes());
        data.extend_from_slice(&self.last_block_id.parts_header.total.to_le_bytes());
        data.extend_from_slice(self.last_block_id.parts_header.root.as_bytes());
        data.extend_from_slice(self.last_commit_hash.as_bytes());
        data.extend_from_slice(self.data_hash.as_bytes());
        Hash256::sha256(&data)
    }
}

/// One validator's vote inside a commit.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct CommitSig {
    /// Index into the validator set.
    pub validator_index: u32,
    /// Ed25519 signature over [`Commit::sign_bytes`].
    pub signature: Vec<u8>,
}

/// The set of votes certifying a block.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Commit {
    /// Height of the certified block.
    pub height: u64,
    pub round: u32,
    /// Id of the certified block.
    pub block_id: BlockId,
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// The commit carried by the first block, which certifies nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bytes each validator signs: chain id, height, round and block id.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + chain_id.len() + 8 + 4 + 32 + 4 + 32);
        data.extend_from_slice(&(chain_id.len() as u64).to_le_bytes());
        data.extend_from_slice(chain_id.as_bytes());
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.round.to_le_bytes());
        data.extend_from_slice(self.block_id.hash.as_bytes());
        data.extend_from_slice(&self.block_id.parts_header.total.to_le_bytes());
        data.extend_from_slice(self.block_id.parts_header.root.as_bytes());
        data
    }

    /// Hash committed to by the next block's header.
    pub fn hash(&self) -> Hash256 {
        let mut data = self.sign_bytes("");
        for sig in &self.signatures {
            data.extend_from_slice(&sig.validator_index.to_le_bytes());
            data.extend_from_slice(&sig.signature);
        }
        Hash256::sha256(&data)
    }
}

/// A complete block: header, raw transactions and the previous block's commit.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// Opaque application transactions.
    pub txs: Vec<Vec<u8>>,
    /// Commit certifying the block at `height - 1`.
    pub last_commit: Commit,
}

impl Block {
    /// The block hash is its header hash.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Merkle root over the SHA-256 of each transaction.
    pub fn compute_data_hash(txs: &[Vec<u8>]) -> Hash256 {
        let leaves: Vec<Hash256> = txs.iter().map(|tx| Hash256::sha256(tx)).collect();
        merkle_root(&leaves)
    }

    /// Split the canonical encoding of this block into `part_size` chunks.
    pub fn make_part_set(&self, part_size: usize) -> Result<PartSet, PartSetError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PartSetError::Decode(e.to_string()))?;
        PartSet::from_data(&encoded, part_size)
    }

    /// Id of this block when transmitted with the given part size.
    pub fn block_id(&self, part_size: usize) -> Result<BlockId, PartSetError> {
        let parts = self.make_part_set(part_size)?;
        Ok(BlockId {
            hash: self.hash(),
            parts_header: parts.header(),
        })
    }
}

/// Stored summary of a block: its id and header.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub header: BlockHeader,
}
