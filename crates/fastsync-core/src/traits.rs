//! Trait interfaces for the collaborators of the sync subsystem.
//!
//! These traits define the contracts between crates:
//! - [`BlockStore`] — durable block storage (fastsync-node implements)
//! - [`Transport`] — peer-to-peer message delivery (fastsync-network implements in memory)
//! - [`BlockVerifier`] — commit verification supplied by the consensus engine
//! - [`BlockExecutor`] — state application supplied by the consensus engine

use bytes::Bytes;

use crate::error::{ExecuteError, StoreError, VerifyError};
use crate::part_set::PartSet;
use crate::types::{Block, BlockId, BlockMeta, Commit, PeerId};

/// Read access to locally committed blocks.
///
/// Heights at or below [`origin_height`](Self::origin_height) have been moved
/// to cold storage and are served by
/// [`load_archived_block`](Self::load_archived_block).
pub trait BlockStore: Send + Sync {
    /// Height of the highest committed block (0 when empty).
    fn height(&self) -> u64;

    /// Highest height no longer held in live storage (0 when nothing is archived).
    fn origin_height(&self) -> u64;

    /// Load a live block. Returns `None` if absent.
    fn load_block(&self, height: u64) -> Result<Option<Block>, StoreError>;

    /// Load a live block's id and header. Returns `None` if absent.
    fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>, StoreError>;

    /// Load the commit this node observed for `height`, before the next block
    /// embedded one.
    fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>, StoreError>;

    /// Load a block from cold storage.
    ///
    /// Default implementation: nothing is archived.
    fn load_archived_block(&self, _height: u64) -> Result<Option<Block>, StoreError> {
        Ok(None)
    }
}

/// Outbound side of the peer-to-peer layer.
pub trait Transport: Send + Sync {
    /// Queue `msg` for `peer` without blocking.
    ///
    /// Returns `false` if the peer is unknown or its send queue is full; the
    /// caller must not retry synchronously.
    fn try_send(&self, peer: &PeerId, channel: u8, msg: Bytes) -> bool;

    /// Queue `msg` for every connected peer, dropping it for full queues.
    fn broadcast(&self, channel: u8, msg: Bytes);

    /// Ask the transport to drop the connection to `peer`.
    fn disconnect(&self, peer: &PeerId, reason: &str);

    /// Number of currently connected peers.
    fn num_peers(&self) -> usize;
}

/// Checks that `commit` certifies the block identified by `block_id` at `height`.
///
/// Must be free of side effects from the pool's perspective.
pub trait BlockVerifier: Send + Sync {
    fn verify(&self, block_id: &BlockId, height: u64, commit: &Commit) -> Result<(), VerifyError>;
}

impl<F> BlockVerifier for F
where
    F: Fn(&BlockId, u64, &Commit) -> Result<(), VerifyError> + Send + Sync,
{
    fn verify(&self, block_id: &BlockId, height: u64, commit: &Commit) -> Result<(), VerifyError> {
        self(block_id, height, commit)
    }
}

/// Applies a verified block to the local state machine.
///
/// A failure here means local execution diverged from the network; the sync
/// reactor treats it as fatal.
pub trait BlockExecutor: Send + Sync {
    fn execute(&self, block: &Block, parts: &PartSet, commit: &Commit) -> Result<(), ExecuteError>;
}

impl<F> BlockExecutor for F
where
    F: Fn(&Block, &PartSet, &Commit) -> Result<(), ExecuteError> + Send + Sync,
{
    fn execute(&self, block: &Block, parts: &PartSet, commit: &Commit) -> Result<(), ExecuteError> {
        self(block, parts, commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockStore {
        blocks: HashMap<u64, Block>,
    }

    impl BlockStore for MockStore {
        fn height(&self) -> u64 {
            self.blocks.keys().copied().max().unwrap_or(0)
        }

        fn origin_height(&self) -> u64 {
            0
        }

        fn load_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
            Ok(self.blocks.get(&height).cloned())
        }

        fn load_block_meta(&self, _height: u64) -> Result<Option<BlockMeta>, StoreError> {
            Ok(None)
        }

        fn load_seen_commit(&self, _height: u64) -> Result<Option<Commit>, StoreError> {
            Ok(None)
        }
    }

    #[test]
    fn archived_blocks_default_to_none() {
        let store = MockStore {
            blocks: HashMap::new(),
        };
        assert_eq!(store.height(), 0);
        assert_eq!(store.load_archived_block(1), Ok(None));
    }

    #[test]
    fn closures_act_as_verifiers() {
        let verifier = |_: &BlockId, height: u64, commit: &Commit| {
            if commit.height == height {
                Ok(())
            } else {
                Err(VerifyError::HeightMismatch {
                    expected: height,
                    got: commit.height,
                })
            }
        };
        let commit = Commit {
            height: 4,
            ..Commit::empty()
        };
        assert!(verifier.verify(&BlockId::default(), 4, &commit).is_ok());
        assert!(verifier.verify(&BlockId::default(), 5, &commit).is_err());
    }

    #[test]
    fn closures_act_as_executors() {
        let executor = |block: &Block, _: &PartSet, _: &Commit| -> Result<(), ExecuteError> {
            Err(ExecuteError::Rejected(format!("height {}", block.height())))
        };
        let block = Block {
            header: crate::types::BlockHeader {
                chain_id: "c".into(),
                height: 2,
                time_ms: 0,
                num_txs: 0,
                last_block_id: BlockId::default(),
                last_commit_hash: crate::types::Hash256::ZERO,
                data_hash: crate::types::Hash256::ZERO,
            },
            txs: vec![],
            last_commit: Commit::empty(),
        };
        let parts = block.make_part_set(64).unwrap();
        assert_eq!(
            executor.execute(&block, &parts, &Commit::empty()),
            Err(ExecuteError::Rejected("height 2".into()))
        );
    }
}
