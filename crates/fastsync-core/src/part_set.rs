//! Block part sets: fixed-size chunks of a block's encoding under a BLAKE3
//! Merkle root.
//!
//! Uses domain-separated hashing to prevent second-preimage attacks:
//! - Leaf hash: `BLAKE3(0x00 || SHA256(part))`
//! - Internal node: `BLAKE3(0x01 || left || right)`
//!
//! Odd-length layers are padded by duplicating the last element.
//! Empty trees produce [`Hash256::ZERO`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PartSetError;
use crate::types::{Block, Hash256};

/// Domain separation prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain separation prefix for internal node hashes.
const NODE_PREFIX: u8 = 0x01;

/// Compute a domain-separated leaf hash: `BLAKE3(0x00 || data)`.
pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute a domain-separated internal node hash: `BLAKE3(0x01 || left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute the Merkle root from a slice of leaf values.
///
/// Returns [`Hash256::ZERO`] for an empty slice.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| node_hash(&pair[0], pair.get(1).unwrap_or(&pair[0])))
        .collect()
}

/// Build every layer of the tree, leaf hashes first and `[root]` last.
fn build_layers(leaves: &[Hash256]) -> Vec<Vec<Hash256>> {
    let mut layers = vec![leaves.iter().map(leaf_hash).collect::<Vec<_>>()];
    while let Some(top) = layers.last().filter(|l| l.len() > 1) {
        let next = next_layer(top);
        layers.push(next);
    }
    layers
}

/// Which side a sibling hash is on relative to the current node.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum Side {
    Left,
    Right,
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ProofStep {
    pub hash: Hash256,
    pub side: Side,
}

/// Merkle inclusion proof for a single part.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MerkleProof {
    /// The leaf value (SHA-256 of the part bytes).
    pub leaf: Hash256,
    /// Sibling hashes from leaf level up to root.
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    fn for_index(layers: &[Vec<Hash256>], leaf: Hash256, index: usize) -> Self {
        let mut path = Vec::with_capacity(layers.len().saturating_sub(1));
        let mut pos = index;
        for layer in &layers[..layers.len() - 1] {
            let sibling = layer.get(pos ^ 1).copied().unwrap_or(layer[pos]);
            let side = if pos % 2 == 0 { Side::Right } else { Side::Left };
            path.push(ProofStep { hash: sibling, side });
            pos /= 2;
        }
        Self { leaf, path }
    }

    /// Recompute the root from the leaf and sibling path, then compare.
    pub fn verify(&self, expected_root: &Hash256) -> bool {
        let mut current = leaf_hash(&self.leaf);
        for step in &self.path {
            current = match step.side {
                Side::Left => node_hash(&step.hash, &current),
                Side::Right => node_hash(&current, &step.hash),
            };
        }
        current == *expected_root
    }
}

/// Number of parts and their Merkle root.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PartSetHeader {
    pub total: u32,
    pub root: Hash256,
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.root.to_string();
        write!(f, "{}:{}", self.total, &root[..12])
    }
}

/// One chunk of an encoded block.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: MerkleProof,
}

impl Part {
    /// Check that this part's bytes hash to its proof leaf and that the
    /// proof leads to `root`.
    pub fn verify(&self, root: &Hash256) -> bool {
        Hash256::sha256(&self.bytes) == self.proof.leaf && self.proof.verify(root)
    }
}

/// A block split into fixed-size, Merkle-proven parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Part>,
}

impl PartSet {
    /// Split `data` into chunks of `part_size` bytes.
    pub fn from_data(data: &[u8], part_size: usize) -> Result<Self, PartSetError> {
        if part_size == 0 {
            return Err(PartSetError::ZeroPartSize);
        }
        let chunks: Vec<&[u8]> = data.chunks(part_size).collect();
        let leaves: Vec<Hash256> = chunks.iter().map(|c| Hash256::sha256(c)).collect();
        if leaves.is_empty() {
            return Ok(Self {
                header: PartSetHeader::default(),
                parts: Vec::new(),
            });
        }

        let layers = build_layers(&leaves);
        let root = layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash256::ZERO);
        let parts = chunks
            .iter()
            .zip(&leaves)
            .enumerate()
            .map(|(i, (chunk, leaf))| Part {
                index: i as u32,
                bytes: chunk.to_vec(),
                proof: MerkleProof::for_index(&layers, *leaf, i),
            })
            .collect();

        Ok(Self {
            header: PartSetHeader {
                total: leaves.len() as u32,
                root,
            },
            parts,
        })
    }

    /// Reassemble a part set received from the network, checking every proof
    /// against `header`.
    pub fn from_parts(header: PartSetHeader, parts: Vec<Part>) -> Result<Self, PartSetError> {
        if parts.len() != header.total as usize {
            return Err(PartSetError::CountMismatch {
                expected: header.total,
                got: parts.len() as u32,
            });
        }
        for (i, part) in parts.iter().enumerate() {
            if part.index as usize != i {
                return Err(PartSetError::OutOfOrder(part.index));
            }
            if !part.verify(&header.root) {
                return Err(PartSetError::InvalidProof(part.index));
            }
        }
        Ok(Self { header, parts })
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Concatenate the part bytes back into the original encoding.
    pub fn assemble(&self) -> Vec<u8> {
        self.parts.iter().flat_map(|p| p.bytes.iter().copied()).collect()
    }

    /// Decode the block this part set was built from.
    pub fn to_block(&self) -> Result<Block, PartSetError> {
        let data = self.assemble();
        let (block, _): (Block, usize) =
            bincode::decode_from_slice(&data, bincode::config::standard())
                .map_err(|e| PartSetError::Decode(e.to_string()))?;
        Ok(block)
    }
}
