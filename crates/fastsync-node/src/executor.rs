//! Block executor that applies synced blocks by appending them to a store.

use std::sync::Arc;

use fastsync_core::error::ExecuteError;
use fastsync_core::part_set::PartSet;
use fastsync_core::traits::BlockExecutor;
use fastsync_core::types::{Block, Commit};
use tracing::trace;

use crate::store::MemoryBlockStore;

/// Saves each executed block, with the commit that certified it, to a
/// [`MemoryBlockStore`].
pub struct StoreExecutor {
    store: Arc<MemoryBlockStore>,
}

impl StoreExecutor {
    pub fn new(store: Arc<MemoryBlockStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryBlockStore> {
        &self.store
    }
}

impl BlockExecutor for StoreExecutor {
    fn execute(&self, block: &Block, parts: &PartSet, commit: &Commit) -> Result<(), ExecuteError> {
        if block.header.num_txs != block.txs.len() as u64 {
            return Err(ExecuteError::Rejected(format!(
                "header declares {} txs, block carries {}",
                block.header.num_txs,
                block.txs.len()
            )));
        }
        self.store.save_block(block, parts, commit)?;
        trace!(height = block.height(), "block applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainBuilder, Validators};
    use fastsync_core::error::StoreError;
    use fastsync_core::traits::BlockStore;

    #[test]
    fn applies_blocks_in_order() {
        let validators = Validators::deterministic(1);
        let chain = ChainBuilder::new("exec", &validators, 1024).build(3).unwrap();
        let store = Arc::new(MemoryBlockStore::new());
        let executor = StoreExecutor::new(Arc::clone(&store));

        for signed in &chain {
            executor
                .execute(&signed.block, &signed.parts, &signed.seen_commit)
                .unwrap();
        }
        assert_eq!(store.height(), 3);
        assert_eq!(store.load_seen_commit(2), Ok(Some(chain[1].seen_commit.clone())));
    }

    #[test]
    fn out_of_order_block_fails() {
        let validators = Validators::deterministic(1);
        let chain = ChainBuilder::new("exec", &validators, 1024).build(2).unwrap();
        let executor = StoreExecutor::new(Arc::new(MemoryBlockStore::new()));
        let err = executor
            .execute(&chain[1].block, &chain[1].parts, &chain[1].seen_commit)
            .unwrap_err();
        assert_eq!(
            err,
            ExecuteError::Store(StoreError::HeightMismatch {
                expected: 1,
                got: 2
            })
        );
    }

    #[test]
    fn inconsistent_tx_count_is_rejected() {
        let validators = Validators::deterministic(1);
        let chain = ChainBuilder::new("exec", &validators, 1024).build(1).unwrap();
        let mut block = chain[0].block.clone();
        block.txs.pop();
        let executor = StoreExecutor::new(Arc::new(MemoryBlockStore::new()));
        assert!(matches!(
            executor.execute(&block, &chain[0].parts, &chain[0].seen_commit),
            Err(ExecuteError::Rejected(_))
        ));
        assert_eq!(executor.store().height(), 0);
    }
}
