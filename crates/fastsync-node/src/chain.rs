//! Deterministic signed chains for simulation and tests.
//!
//! [`Validators`] holds signing keys derived from fixed seeds so every run
//! produces the same chain. [`ChainBuilder`] links blocks through
//! `last_block_id` and `last_commit`, signing each commit with every
//! validator.

use ed25519_dalek::{Signer, SigningKey};
use fastsync_core::error::PartSetError;
use fastsync_core::part_set::PartSet;
use fastsync_core::types::{Block, BlockHeader, BlockId, Commit, CommitSig, Hash256};

use crate::verifier::ValidatorSet;

/// Signing keys of a validator set.
pub struct Validators {
    keys: Vec<SigningKey>,
}

impl Validators {
    /// `n` validators whose keys are derived from their index.
    pub fn deterministic(n: usize) -> Self {
        let keys = (0..n as u64)
            .map(|i| {
                let mut seed = b"fastsync-validator".to_vec();
                seed.extend_from_slice(&i.to_le_bytes());
                SigningKey::from_bytes(Hash256::sha256(&seed).as_bytes())
            })
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn validator_set(&self) -> ValidatorSet {
        ValidatorSet::new(self.keys.iter().map(SigningKey::verifying_key).collect())
    }

    /// A round-0 commit for `block_id` at `height` signed by every validator.
    pub fn sign_commit(&self, chain_id: &str, height: u64, block_id: BlockId) -> Commit {
        let mut commit = Commit {
            height,
            round: 0,
            block_id,
            signatures: Vec::with_capacity(self.keys.len()),
        };
        let msg = commit.sign_bytes(chain_id);
        commit.signatures = self
            .keys
            .iter()
            .enumerate()
            .map(|(i, key)| CommitSig {
                validator_index: i as u32,
                signature: key.sign(&msg).to_bytes().to_vec(),
            })
            .collect();
        commit
    }
}

/// A committed block with the part set it was committed as and the commit
/// the network produced for it.
#[derive(Debug, Clone)]
pub struct SignedBlock {
    pub block: Block,
    pub parts: PartSet,
    pub seen_commit: Commit,
}

impl SignedBlock {
    pub fn height(&self) -> u64 {
        self.block.height()
    }

    /// A copy with every transaction byte flipped. The header stays
    /// internally consistent and the embedded commit is untouched, so the
    /// block decodes and links fine but its hash no longer matches what the
    /// validators signed.
    pub fn forge(&self, part_size: usize) -> Result<SignedBlock, PartSetError> {
        let mut block = self.block.clone();
        for tx in &mut block.txs {
            tx.iter_mut().for_each(|b| *b ^= 0x5a);
        }
        block.header.data_hash = Block::compute_data_hash(&block.txs);
        let parts = block.make_part_set(part_size)?;
        Ok(SignedBlock {
            block,
            parts,
            seen_commit: self.seen_commit.clone(),
        })
    }
}

/// Builds a linked, signed chain starting at height 1.
pub struct ChainBuilder<'a> {
    chain_id: String,
    validators: &'a Validators,
    part_size: usize,
    txs_per_block: usize,
    tx_size: usize,
    genesis_time_ms: u64,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(chain_id: impl Into<String>, validators: &'a Validators, part_size: usize) -> Self {
        Self {
            chain_id: chain_id.into(),
            validators,
            part_size,
            txs_per_block: 4,
            tx_size: 64,
            genesis_time_ms: 1_700_000_000_000,
        }
    }

    pub fn txs_per_block(mut self, n: usize) -> Self {
        self.txs_per_block = n;
        self
    }

    pub fn tx_size(mut self, bytes: usize) -> Self {
        self.tx_size = bytes;
        self
    }

    /// Build blocks `1..=n`.
    pub fn build(&self, n: u64) -> Result<Vec<SignedBlock>, PartSetError> {
        let mut chain: Vec<SignedBlock> = Vec::with_capacity(n as usize);
        for height in 1..=n {
            let last_commit = chain
                .last()
                .map(|prev| prev.seen_commit.clone())
                .unwrap_or_else(Commit::empty);
            let txs = self.make_txs(height);
            let block = Block {
                header: BlockHeader {
                    chain_id: self.chain_id.clone(),
                    height,
                    time_ms: self.genesis_time_ms + height * 1000,
                    num_txs: txs.len() as u64,
                    last_block_id: last_commit.block_id.clone(),
                    last_commit_hash: last_commit.hash(),
                    data_hash: Block::compute_data_hash(&txs),
                },
                txs,
                last_commit,
            };
            let parts = block.make_part_set(self.part_size)?;
            let block_id = BlockId {
                hash: block.hash(),
                parts_header: parts.header(),
            };
            let seen_commit = self.validators.sign_commit(&self.chain_id, height, block_id);
            chain.push(SignedBlock {
                block,
                parts,
                seen_commit,
            });
        }
        Ok(chain)
    }

    fn make_txs(&self, height: u64) -> Vec<Vec<u8>> {
        (0..self.txs_per_block as u64)
            .map(|i| {
                let mut tx = vec![0u8; self.tx_size.max(16)];
                tx[..8].copy_from_slice(&height.to_le_bytes());
                tx[8..16].copy_from_slice(&i.to_le_bytes());
                tx
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::CommitVerifier;
    use fastsync_core::traits::BlockVerifier;

    #[test]
    fn keys_are_deterministic() {
        let a = Validators::deterministic(3).validator_set();
        let b = Validators::deterministic(3).validator_set();
        assert_eq!(a, b);
        assert_ne!(a.get(0), a.get(1));
    }

    #[test]
    fn blocks_link_to_their_parent() {
        let validators = Validators::deterministic(4);
        let chain = ChainBuilder::new("chain", &validators, 512)
            .build(5)
            .unwrap();
        assert_eq!(chain.len(), 5);
        assert!(chain[0].block.header.last_block_id.is_zero());

        for pair in chain.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert_eq!(next.height(), prev.height() + 1);
            assert_eq!(next.block.last_commit, prev.seen_commit);
            assert_eq!(
                next.block.header.last_block_id,
                prev.block.block_id(512).unwrap()
            );
            assert_eq!(next.block.header.last_commit_hash, prev.seen_commit.hash());
        }
    }

    #[test]
    fn embedded_commits_verify() {
        let validators = Validators::deterministic(4);
        let verifier = CommitVerifier::new("chain", validators.validator_set());
        let chain = ChainBuilder::new("chain", &validators, 512)
            .txs_per_block(2)
            .tx_size(300)
            .build(3)
            .unwrap();
        for pair in chain.windows(2) {
            let id = pair[0].block.block_id(512).unwrap();
            assert_eq!(
                verifier.verify(&id, pair[0].height(), &pair[1].block.last_commit),
                Ok(())
            );
        }
        // Small parts split a block into several.
        assert!(chain[0].parts.total() > 1);
    }

    #[test]
    fn forged_block_fails_its_commit() {
        let validators = Validators::deterministic(4);
        let verifier = CommitVerifier::new("chain", validators.validator_set());
        let chain = ChainBuilder::new("chain", &validators, 512).build(2).unwrap();
        let forged = chain[0].forge(512).unwrap();

        assert_eq!(forged.height(), 1);
        assert_ne!(forged.block.hash(), chain[0].block.hash());
        assert_eq!(forged.block.last_commit, chain[0].block.last_commit);
        let id = forged.block.block_id(512).unwrap();
        assert_eq!(
            verifier.verify(&id, 1, &chain[1].block.last_commit),
            Err(fastsync_core::error::VerifyError::BlockIdMismatch)
        );
    }
}
