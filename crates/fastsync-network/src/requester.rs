//! Per-height request state machine.
//!
//! Each height in the pool's window has one [`RequesterState`] stored in the
//! pool's map and one tokio task running [`run_requester`]. The task loops:
//! acquire a peer at or above its height, emit a [`BlockRequest`], then wait
//! for a delivery, a redo, or shutdown. The pool wakes it through an
//! unbounded signal channel; dropping the sender (when the height is popped)
//! ends the task.

use std::sync::Arc;

use fastsync_core::types::{Block, PeerId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::pool::{Assignment, BlockPool};

/// A block request the reactor must put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub height: u64,
    pub peer_id: PeerId,
}

/// Wake-up sent from the pool to a requester task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The expected peer delivered the block.
    GotBlock,
    /// The expected peer was removed; start over.
    Redo,
}

/// Pool-side state for one height.
#[derive(Debug)]
pub(crate) struct RequesterState {
    /// Peer currently expected to answer.
    pub(crate) peer_id: Option<PeerId>,
    pub(crate) block: Option<Arc<Block>>,
    /// Bytes of the response that carried `block`.
    pub(crate) block_size: usize,
    /// A redo was signalled but the task has not processed it yet.
    pub(crate) redo_pending: bool,
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
}

impl RequesterState {
    pub(crate) fn new(signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            peer_id: None,
            block: None,
            block_size: 0,
            redo_pending: false,
            signals,
        }
    }

    /// Wake the task. A closed channel means the task already exited.
    pub(crate) fn signal(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }
}

/// Drive the requester for `height` until it is popped or the pool stops.
pub(crate) async fn run_requester(
    pool: Arc<BlockPool>,
    height: u64,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut shutdown: watch::Receiver<bool>,
) {
    'outer: loop {
        let peer_id = loop {
            if *shutdown.borrow() {
                return;
            }
            match pool.assign_peer(height) {
                Assignment::Assigned(peer_id) => break peer_id,
                Assignment::Gone => return,
                Assignment::NoPeer => {
                    tokio::select! {
                        _ = shutdown.wait_for(|stopped| *stopped) => return,
                        _ = tokio::time::sleep(pool.config().request_interval) => {}
                    }
                }
            }
        };

        trace!(height, peer = %peer_id, "requester: assigned peer");
        if !pool.send_request(BlockRequest { height, peer_id }).await {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => return,
                signal = signals.recv() => match signal {
                    None => return,
                    Some(Signal::GotBlock) => {
                        trace!(height, "requester: block delivered");
                    }
                    Some(Signal::Redo) => {
                        debug!(height, "requester: redo");
                        pool.reset_requester(height);
                        continue 'outer;
                    }
                },
            }
        }
    }
}
