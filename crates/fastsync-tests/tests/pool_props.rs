//! Property tests for the block pool under random peer churn and delivery.
//!
//! Whatever order peers join, leave, answer or lie in, the pool must commit
//! heights one at a time with no gaps, count exactly the requesters still
//! waiting for a block as pending, and never exceed its window.

use std::time::Duration;

use fastsync_core::types::PeerId;
use fastsync_network::{BlockPool, BlockRequest, SyncConfig};
use fastsync_node::{SignedBlock, Validators};
use fastsync_tests::helpers::*;
use proptest::prelude::*;
use tokio::sync::mpsc;

const CHAIN_LEN: u64 = 40;
const WINDOW: usize = 12;

#[derive(Debug, Clone)]
enum Op {
    /// Peer `n` reports a height.
    Status(u8, u64),
    RemovePeer(u8),
    /// Answer an outstanding request with the canonical block.
    Deliver(usize),
    /// Answer an outstanding request with a forged block.
    Forge(usize),
    /// One verify-and-commit step.
    Sync,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0u8..4, 1..=CHAIN_LEN).prop_map(|(p, h)| Op::Status(p, h)),
        1 => (0u8..4).prop_map(Op::RemovePeer),
        6 => any::<usize>().prop_map(Op::Deliver),
        1 => any::<usize>().prop_map(Op::Forge),
        4 => Just(Op::Sync),
    ]
}

fn peer(n: u8) -> PeerId {
    PeerId::new(format!("p{n}"))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Apply `ops` to a fresh pool and return the heights committed, in order.
fn run_ops(ops: Vec<Op>, chain: &[SignedBlock], forged: &[SignedBlock]) -> Vec<u64> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();

    rt.block_on(async {
        let (requests_tx, mut requests_rx) = mpsc::channel(1024);
        let (timeouts_tx, mut timeouts_rx) = mpsc::channel(1024);
        let config = SyncConfig {
            max_total_requesters: WINDOW,
            max_pending_requests: WINDOW,
            max_pending_per_peer: 4,
            ..test_config()
        };
        let pool = BlockPool::new(1, config, requests_tx, timeouts_tx);
        pool.start();

        let mut outstanding: Vec<BlockRequest> = Vec::new();
        let mut committed = Vec::new();

        for op in ops {
            match op {
                Op::Status(p, h) => pool.set_peer_height(&peer(p), h),
                Op::RemovePeer(p) => pool.remove_peer(&peer(p)),
                Op::Deliver(i) | Op::Forge(i) if !outstanding.is_empty() => {
                    let request = outstanding.swap_remove(i % outstanding.len());
                    let source = if matches!(op, Op::Forge(_)) { forged } else { chain };
                    if let Some(signed) = source.get(request.height as usize - 1) {
                        pool.add_block(&request.peer_id, signed.block.clone(), 128);
                    }
                }
                Op::Deliver(_) | Op::Forge(_) => {}
                Op::Sync => {
                    let height = pool.get_status().height;
                    if let (Some(first), Some(_second)) = pool.peek_two_blocks() {
                        if chain.get(height as usize - 1).map(|s| &s.block) == Some(first.as_ref()) {
                            pool.pop_request().unwrap();
                            committed.push(height);
                        } else {
                            pool.redo_request(height).unwrap();
                        }
                    }
                }
            }

            settle().await;
            while let Ok(request) = requests_rx.try_recv() {
                outstanding.push(request);
            }
            while timeouts_rx.try_recv().is_ok() {}

            let status = pool.get_status();
            assert_eq!(status.height, 1 + committed.len() as u64);
            assert!(status.num_requesters <= WINDOW);
            // Every redo has been processed, so exactly the blockless
            // requesters are pending.
            assert_eq!(
                status.num_pending, status.num_without_block,
                "pending {} != requesters without a block {}",
                status.num_pending, status.num_without_block
            );
        }

        pool.stop();
        committed
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn pool_commits_contiguous_heights(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let validators = Validators::deterministic(1);
        let chain = build_chain(&validators, CHAIN_LEN);
        let forged = forge_chain(&chain);

        let committed = run_ops(ops, &chain, &forged);
        let expected: Vec<u64> = (1..=committed.len() as u64).collect();
        prop_assert_eq!(committed, expected);
    }
}

#[test]
fn steady_delivery_commits_the_whole_window() {
    let validators = Validators::deterministic(1);
    let chain = build_chain(&validators, CHAIN_LEN);
    let forged = forge_chain(&chain);

    let mut ops = vec![Op::Status(0, CHAIN_LEN), Op::Status(1, CHAIN_LEN)];
    for _ in 0..60 {
        ops.extend([Op::Deliver(0), Op::Deliver(0), Op::Sync]);
    }
    let committed = run_ops(ops, &chain, &forged);
    assert!(committed.len() >= 20, "only committed {committed:?}");
}
