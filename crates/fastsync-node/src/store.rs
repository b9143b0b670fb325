//! In-memory block store with an archive boundary.
//!
//! Implements [`BlockStore`] over height-indexed maps behind a single
//! [`RwLock`]. Blocks at or below [`origin_height`](BlockStore::origin_height)
//! have been moved to an archive map and are only reachable through
//! [`load_archived_block`](BlockStore::load_archived_block), mirroring a node
//! that prunes its hot storage into cold storage.

use std::collections::BTreeMap;

use fastsync_core::error::StoreError;
use fastsync_core::part_set::PartSet;
use fastsync_core::traits::BlockStore;
use fastsync_core::types::{Block, BlockId, BlockMeta, Commit};
use parking_lot::RwLock;
use tracing::{debug, info};

#[derive(Default)]
struct Inner {
    height: u64,
    origin_height: u64,
    blocks: BTreeMap<u64, Block>,
    metas: BTreeMap<u64, BlockMeta>,
    seen_commits: BTreeMap<u64, Commit>,
    archive: BTreeMap<u64, Block>,
}

/// Thread-safe in-memory block store.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<Inner>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the block at `height() + 1`.
    ///
    /// `parts` is the part set the block was committed as; its header becomes
    /// part of the stored block id. `seen_commit` is the commit this node
    /// observed for the block.
    pub fn save_block(
        &self,
        block: &Block,
        parts: &PartSet,
        seen_commit: &Commit,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let expected = inner.height + 1;
        let height = block.height();
        if height != expected {
            return Err(StoreError::HeightMismatch {
                expected,
                got: height,
            });
        }

        let meta = BlockMeta {
            block_id: BlockId {
                hash: block.hash(),
                parts_header: parts.header(),
            },
            header: block.header.clone(),
        };
        inner.blocks.insert(height, block.clone());
        inner.metas.insert(height, meta);
        inner.seen_commits.insert(height, seen_commit.clone());
        inner.height = height;
        debug!(height, txs = block.txs.len(), "block saved");
        Ok(())
    }

    /// Move every live block at or below `height` into the archive.
    ///
    /// Returns the number of blocks moved. Heights above the store height are
    /// rejected with [`StoreError::NotFound`].
    pub fn archive_up_to(&self, height: u64) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        if height > inner.height {
            return Err(StoreError::NotFound(height));
        }
        if height <= inner.origin_height {
            return Ok(0);
        }

        let keep = inner.blocks.split_off(&(height + 1));
        let moved = std::mem::replace(&mut inner.blocks, keep);
        let count = moved.len();
        for h in moved.keys() {
            inner.metas.remove(h);
            inner.seen_commits.remove(h);
        }
        inner.archive.extend(moved);
        inner.origin_height = height;
        info!(origin_height = height, moved = count, "archived blocks");
        Ok(count)
    }

    /// Number of blocks in live storage.
    pub fn live_len(&self) -> usize {
        self.inner.read().blocks.len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn height(&self) -> u64 {
        self.inner.read().height
    }

    fn origin_height(&self) -> u64 {
        self.inner.read().origin_height
    }

    fn load_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        Ok(self.inner.read().blocks.get(&height).cloned())
    }

    fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>, StoreError> {
        Ok(self.inner.read().metas.get(&height).cloned())
    }

    fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>, StoreError> {
        Ok(self.inner.read().seen_commits.get(&height).cloned())
    }

    fn load_archived_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        Ok(self.inner.read().archive.get(&height).cloned())
    }
}
