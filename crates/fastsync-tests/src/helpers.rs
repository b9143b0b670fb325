//! Shared helpers for integration tests: signed chains, seeded stores and
//! nodes wired to a [`MemoryNetwork`].

use std::sync::Arc;
use std::time::Duration;

use fastsync_core::traits::BlockStore;
use fastsync_core::types::PeerId;
use fastsync_network::{
    drive, MemoryNetwork, MemoryTransport, SwitchToConsensus, SyncConfig, SyncReactor,
};
use fastsync_node::{
    ChainBuilder, CommitVerifier, MemoryBlockStore, SignedBlock, StoreExecutor, Validators,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const CHAIN_ID: &str = "fastsync-test";
pub const PART_SIZE: usize = 4096;

/// Short timers and the part size the test chains are signed with.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        block_part_size: PART_SIZE,
        ..SyncConfig::testing()
    }
}

/// Like [`test_config`] but the node only serves.
pub fn serving_config() -> SyncConfig {
    SyncConfig {
        fast_sync: false,
        ..test_config()
    }
}

/// A signed chain of `n` blocks.
pub fn build_chain(validators: &Validators, n: u64) -> Vec<SignedBlock> {
    ChainBuilder::new(CHAIN_ID, validators, PART_SIZE)
        .build(n)
        .unwrap()
}

/// A store holding the first `height` blocks of `chain`.
pub fn store_with(chain: &[SignedBlock], height: u64) -> Arc<MemoryBlockStore> {
    let store = MemoryBlockStore::new();
    for signed in chain.iter().take(height as usize) {
        store
            .save_block(&signed.block, &signed.parts, &signed.seen_commit)
            .unwrap();
    }
    Arc::new(store)
}

/// The same chain with every block forged; see [`SignedBlock::forge`].
pub fn forge_chain(chain: &[SignedBlock]) -> Vec<SignedBlock> {
    chain
        .iter()
        .map(|signed| signed.forge(PART_SIZE).unwrap())
        .collect()
}

/// A node on a [`MemoryNetwork`]: store, reactor and the task feeding it
/// network events.
pub struct TestNode {
    pub id: PeerId,
    pub store: Arc<MemoryBlockStore>,
    pub reactor: Arc<SyncReactor>,
    pub transport: MemoryTransport,
    switch: Option<oneshot::Receiver<SwitchToConsensus>>,
    driver: JoinHandle<()>,
}

impl TestNode {
    /// Join `net` as `id` and start dispatching events. The sync loop is not
    /// started; see [`start_sync`](Self::start_sync).
    pub fn spawn(
        net: &MemoryNetwork,
        id: &str,
        store: Arc<MemoryBlockStore>,
        config: SyncConfig,
        validators: &Validators,
    ) -> Self {
        let (transport, events) = net.join(id);
        let verifier = CommitVerifier::new(CHAIN_ID, validators.validator_set());
        let executor = StoreExecutor::new(Arc::clone(&store));
        let (reactor, switch) = SyncReactor::new(
            config,
            store.clone(),
            Arc::new(transport.clone()),
            Arc::new(verifier),
            Arc::new(executor),
        );
        let driver = tokio::spawn(drive(Arc::clone(&reactor), events));
        Self {
            id: PeerId::from(id),
            store,
            reactor,
            transport,
            switch: Some(switch),
            driver,
        }
    }

    /// A node serving all of `chain`.
    pub fn serving(
        net: &MemoryNetwork,
        id: &str,
        chain: &[SignedBlock],
        validators: &Validators,
    ) -> Self {
        let store = store_with(chain, chain.len() as u64);
        Self::spawn(net, id, store, serving_config(), validators)
    }

    /// Run the reactor's sync loop in the background.
    pub fn start_sync(&self) -> JoinHandle<Result<(), fastsync_core::SyncError>> {
        let reactor = Arc::clone(&self.reactor);
        tokio::spawn(async move { reactor.run().await })
    }

    /// Wait up to `limit` for the switch to consensus.
    pub async fn wait_for_switch(&mut self, limit: Duration) -> Option<SwitchToConsensus> {
        let switch = self.switch.take()?;
        tokio::time::timeout(limit, switch).await.ok()?.ok()
    }

    /// Whether the switch has fired, without waiting.
    pub fn switched(&mut self) -> bool {
        match self.switch.as_mut() {
            Some(rx) => rx.try_recv().is_ok(),
            None => true,
        }
    }

    pub fn height(&self) -> u64 {
        self.store.height()
    }

    /// Ids of the peers this node currently has a link to.
    pub fn linked_peers(&self) -> Vec<PeerId> {
        self.transport.network().peers_of(&self.id)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.reactor.stop();
        self.driver.abort();
    }
}

/// Assert that `store` holds exactly the first `height` blocks of `chain`.
pub fn assert_synced_to(store: &MemoryBlockStore, chain: &[SignedBlock], height: u64) {
    assert_eq!(store.height(), height);
    for signed in chain.iter().take(height as usize) {
        let h = signed.height();
        assert_eq!(
            store.load_block(h).unwrap().as_ref(),
            Some(&signed.block),
            "block {h} differs from the canonical chain"
        );
    }
}

/// Advance the paused clock in small steps until `cond` holds or `limit`
/// elapses. Returns whether `cond` held.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cond()
}
