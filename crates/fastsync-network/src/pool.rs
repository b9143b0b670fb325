//! Height-indexed pool of block requesters.
//!
//! The pool owns a contiguous window of requesters starting at the lowest
//! uncommitted height, plus the registry of peers serving them. All of it
//! lives in one [`PoolState`] behind a single lock; requesters and peers are
//! plain state records mutated only through pool methods. Background work
//! (one task per requester, a maintenance loop, per-peer liveness timers)
//! reaches back into the pool through these methods.
//!
//! Outbound needs are reported on two channels owned by the reactor: a
//! [`BlockRequest`] queue and a queue of peers that timed out.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use fastsync_core::error::SyncError;
use fastsync_core::types::{Block, PeerId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::peer::PoolPeer;
use crate::requester::{self, BlockRequest, RequesterState, Signal};

/// Snapshot of the pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Lowest height not yet popped.
    pub height: u64,
    /// Requests still waiting for a block.
    pub num_pending: usize,
    /// Live requesters.
    pub num_requesters: usize,
    /// Requesters not holding a block.
    pub num_without_block: usize,
}

/// Outcome of a requester asking for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Assignment {
    Assigned(PeerId),
    NoPeer,
    /// The requester is no longer in the pool.
    Gone,
}

#[derive(Debug)]
struct PoolState {
    height: u64,
    requesters: BTreeMap<u64, RequesterState>,
    num_pending: usize,
    peers: BTreeMap<PeerId, PoolPeer>,
    started_at: Option<Instant>,
}

/// The block pool. Always held in an [`Arc`].
pub struct BlockPool {
    config: SyncConfig,
    state: Mutex<PoolState>,
    requests_tx: mpsc::Sender<BlockRequest>,
    timeouts_tx: mpsc::Sender<PeerId>,
    started: AtomicBool,
    /// `true` once the pool is stopped.
    shutdown: watch::Sender<bool>,
    weak_self: Weak<BlockPool>,
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.get_status();
        f.debug_struct("BlockPool")
            .field("height", &status.height)
            .field("num_pending", &status.num_pending)
            .field("num_requesters", &status.num_requesters)
            .field("running", &self.is_running())
            .finish()
    }
}

impl BlockPool {
    /// Create a pool whose first requested height is `start_height`.
    ///
    /// Nothing runs until [`start`](Self::start) is called.
    pub fn new(
        start_height: u64,
        config: SyncConfig,
        requests_tx: mpsc::Sender<BlockRequest>,
        timeouts_tx: mpsc::Sender<PeerId>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            config,
            state: Mutex::new(PoolState {
                height: start_height,
                requesters: BTreeMap::new(),
                num_pending: 0,
                peers: BTreeMap::new(),
                started_at: None,
            }),
            requests_tx,
            timeouts_tx,
            started: AtomicBool::new(false),
            shutdown,
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start the maintenance loop that keeps the requester window full.
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if !self.mark_started() {
            return;
        }
        info!(height = self.get_status().height, "block pool started");
        tokio::spawn(Arc::clone(self).make_requesters_routine());
    }

    /// Record the start time and flip the running flag. Returns `false` if
    /// already started.
    fn mark_started(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.lock().started_at = Some(Instant::now());
        true
    }

    /// Stop the pool. Every requester task and the maintenance loop exit at
    /// their next suspension point.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!(height = self.get_status().height, "block pool stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !*self.shutdown.borrow()
    }

    pub fn get_status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            height: state.height,
            num_pending: state.num_pending,
            num_requesters: state.requesters.len(),
            num_without_block: state.requesters.values().filter(|r| r.block.is_none()).count(),
        }
    }

    pub fn num_peers(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Highest height any known peer has claimed (0 with no peers).
    pub fn max_peer_height(&self) -> u64 {
        let state = self.state.lock();
        state.peers.values().map(PoolPeer::height).max().unwrap_or(0)
    }

    /// Whether fast sync can hand over to consensus.
    ///
    /// Requires at least one peer, a pool that has either committed past
    /// height 0 or run for the minimum age, and no peer claiming a height
    /// above ours.
    pub fn is_caught_up(&self) -> bool {
        let state = self.state.lock();
        if state.peers.is_empty() {
            debug!("block pool has no peers");
            return false;
        }
        let max_peer_height = state.peers.values().map(PoolPeer::height).max().unwrap_or(0);
        let old_enough = state
            .started_at
            .is_some_and(|at| at.elapsed() > self.config.catch_up_min_age);
        let caught_up = (state.height > 0 || old_enough)
            && (max_peer_height == 0 || state.height >= max_peer_height);
        debug!(
            caught_up,
            height = state.height,
            max_peer_height,
            "block pool catch-up check"
        );
        caught_up
    }

    /// Blocks at the pool height and the one above it, if delivered.
    ///
    /// The second block's embedded commit certifies the first.
    pub fn peek_two_blocks(&self) -> (Option<Arc<Block>>, Option<Arc<Block>>) {
        let state = self.state.lock();
        let first = state
            .requesters
            .get(&state.height)
            .and_then(|r| r.block.clone());
        let second = state
            .requesters
            .get(&(state.height + 1))
            .and_then(|r| r.block.clone());
        (first, second)
    }

    /// Drop the requester at the pool height and advance the height by one.
    ///
    /// Only the requester has to exist. A peer removal can withdraw the block
    /// between [`peek_two_blocks`] and this call; the caller already holds it,
    /// so the height is committed anyway and whatever the requester still
    /// counted as pending is settled here.
    ///
    /// [`peek_two_blocks`]: Self::peek_two_blocks
    pub fn pop_request(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let height = state.height;
        let Some(requester) = state.requesters.remove(&height) else {
            error!(height, "no requester to pop at pool height");
            return Err(SyncError::NothingToPop { height });
        };
        // A blockless requester is pending once, and once more while a redo
        // it has not processed yet is outstanding.
        let settled = usize::from(requester.block.is_none()) + usize::from(requester.redo_pending);
        state.num_pending = state.num_pending.saturating_sub(settled);
        if requester.block.is_none() {
            debug!(height, "popping a height whose block was withdrawn");
            if let Some(peer) = requester.peer_id.as_ref().and_then(|id| state.peers.get_mut(id)) {
                peer.cancel_pending();
            }
        }
        state.height += 1;
        debug!(height, "popped block request");
        Ok(())
    }

    /// Invalidate the block at `height` after it failed verification.
    ///
    /// Removes the peer that served it, which re-queues every height that
    /// peer was serving. Returns the removed peer, or `None` when an earlier
    /// removal already released the height or withdrew its block.
    pub fn redo_request(&self, height: u64) -> Result<Option<PeerId>, SyncError> {
        let mut state = self.state.lock();
        let Some(requester) = state.requesters.get(&height) else {
            error!(height, "redo requested for a height without a requester");
            return Err(SyncError::MissingBlock { height });
        };
        if requester.block.is_none() {
            debug!(height, "redo requested after the block was already withdrawn");
            return Ok(None);
        }
        let peer_id = requester.peer_id.clone();
        if let Some(peer_id) = &peer_id {
            warn!(height, peer = %peer_id, "removing peer that served an invalid block");
            remove_peer_locked(&mut state, peer_id);
        }
        Ok(peer_id)
    }

    /// Hand a received block to the requester waiting for it.
    ///
    /// Accepted only if a requester exists at the block's height, holds no
    /// block yet, and is waiting on exactly `peer_id`. Anything else is a late
    /// or unsolicited response and is ignored.
    pub fn add_block(&self, peer_id: &PeerId, block: Block, block_size: usize) -> bool {
        let mut state = self.state.lock();
        let state = &mut *state;
        let height = block.height();

        let Some(requester) = state.requesters.get_mut(&height) else {
            debug!(height, peer = %peer_id, "ignoring block outside the request window");
            return false;
        };
        if requester.block.is_some() || requester.peer_id.as_ref() != Some(peer_id) {
            debug!(height, peer = %peer_id, "ignoring block from unexpected peer");
            return false;
        }
        requester.block = Some(Arc::new(block));
        requester.block_size = block_size;
        requester.signal(Signal::GotBlock);
        state.num_pending = state.num_pending.saturating_sub(1);

        if let Some(peer) = state.peers.get_mut(peer_id) {
            if peer.decr_pending(block_size as u64) {
                peer.reset_timeout(self.config.peer_timeout, self.timeout_callback());
            }
        }
        true
    }

    /// Insert or update a peer's claimed height.
    pub fn set_peer_height(&self, peer_id: &PeerId, height: u64) {
        let mut state = self.state.lock();
        match state.peers.get_mut(peer_id) {
            Some(peer) => peer.set_height(height),
            None => {
                debug!(peer = %peer_id, height, "new pool peer");
                state
                    .peers
                    .insert(peer_id.clone(), PoolPeer::new(peer_id.clone(), height));
            }
        }
    }

    /// Remove a peer and re-queue every height it was serving.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let mut state = self.state.lock();
        remove_peer_locked(&mut state, peer_id);
    }

    // ---------------------------------------------------------------------
    // Requester and maintenance internals
    // ---------------------------------------------------------------------

    /// Pick a peer for `height` and pin it to the requester in one step.
    pub(crate) fn assign_peer(&self, height: u64) -> Assignment {
        let mut state = self.state.lock();
        if !state.requesters.contains_key(&height) {
            return Assignment::Gone;
        }
        let Some(peer_id) = self.pick_incr_available_peer(&mut state, height) else {
            return Assignment::NoPeer;
        };
        if let Some(requester) = state.requesters.get_mut(&height) {
            requester.peer_id = Some(peer_id.clone());
        }
        Assignment::Assigned(peer_id)
    }

    /// Evict timed-out peers, then pick the eligible peer with the fewest
    /// outstanding requests (lowest id on ties) and count the new request
    /// against it.
    fn pick_incr_available_peer(&self, state: &mut PoolState, min_height: u64) -> Option<PeerId> {
        let timed_out: Vec<PeerId> = state
            .peers
            .values()
            .filter(|p| p.timed_out())
            .map(|p| p.id().clone())
            .collect();
        for peer_id in &timed_out {
            remove_peer_locked(state, peer_id);
        }

        let cap = self.config.max_pending_per_peer;
        let peer = state
            .peers
            .values_mut()
            .filter(|p| p.num_pending() < cap && p.height() >= min_height)
            .min_by_key(|p| p.num_pending())?;
        if peer.incr_pending(self.config.min_recv_rate) {
            peer.reset_timeout(self.config.peer_timeout, self.timeout_callback());
        }
        Some(peer.id().clone())
    }

    /// Clear a requester's assignment after it processed a redo.
    pub(crate) fn reset_requester(&self, height: u64) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(requester) = state.requesters.get_mut(&height) else {
            return;
        };
        requester.peer_id = None;
        requester.redo_pending = false;
        if requester.block.take().is_none() {
            // The removal counted this height again although it never
            // stopped pending.
            state.num_pending = state.num_pending.saturating_sub(1);
        }
    }

    /// Queue a block request for the reactor. Returns `false` once the pool
    /// has stopped.
    pub(crate) async fn send_request(&self, request: BlockRequest) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            sent = self.requests_tx.send(request) => sent.is_ok(),
            _ = shutdown.wait_for(|stopped| *stopped) => false,
        }
    }

    async fn send_timeout(&self, peer_id: PeerId) {
        if !self.is_running() {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = self.timeouts_tx.send(peer_id) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => {}
        }
    }

    fn timeout_callback(
        &self,
    ) -> impl FnOnce(PeerId, u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    + Send
    + 'static {
        let weak = self.weak_self.clone();
        move |peer_id, epoch| {
            Box::pin(async move {
                if let Some(pool) = weak.upgrade() {
                    pool.on_peer_timeout(peer_id, epoch).await;
                }
            })
        }
    }

    async fn on_peer_timeout(&self, peer_id: PeerId, epoch: u64) {
        let fired = {
            let mut state = self.state.lock();
            state
                .peers
                .get_mut(&peer_id)
                .is_some_and(|peer| peer.mark_timed_out(epoch))
        };
        if fired {
            warn!(peer = %peer_id, reason = "no response within liveness window", "peer timed out");
            self.send_timeout(peer_id).await;
        }
    }

    /// Extend the window by one requester at `height + len(requesters)`.
    pub(crate) fn make_next_requester(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let next_height = state.height + state.requesters.len() as u64;
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        state
            .requesters
            .insert(next_height, RequesterState::new(signals_tx));
        state.num_pending += 1;
        drop(state);

        tokio::spawn(requester::run_requester(
            Arc::clone(self),
            next_height,
            signals_rx,
            self.shutdown.subscribe(),
        ));
    }

    async fn make_requesters_routine(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let status = self.get_status();
            if status.num_pending >= self.config.max_pending_requests
                || status.num_requesters >= self.config.max_total_requesters
            {
                tokio::select! {
                    _ = shutdown.wait_for(|stopped| *stopped) => break,
                    _ = tokio::time::sleep(self.config.request_interval) => {}
                }
                self.remove_timed_out_peers().await;
            } else {
                self.make_next_requester();
                tokio::task::yield_now().await;
            }
        }
        debug!("block pool maintenance loop exited");
    }

    /// Evict peers whose receive rate fell below the floor while serving,
    /// along with any already marked timed out.
    async fn remove_timed_out_peers(&self) {
        let newly_timed_out = {
            let mut state = self.state.lock();
            let floor = self.config.min_recv_rate;
            let mut newly_timed_out = Vec::new();
            for peer in state.peers.values_mut() {
                if peer.timed_out() || peer.num_pending() == 0 {
                    continue;
                }
                if let Some(rate) = peer.current_rate() {
                    if rate != 0.0 && rate < floor {
                        warn!(peer = %peer.id(), rate, floor, reason = "receive rate too low", "peer timed out");
                        peer.force_timed_out();
                        newly_timed_out.push(peer.id().clone());
                    }
                }
            }
            let evict: Vec<PeerId> = state
                .peers
                .values()
                .filter(|p| p.timed_out())
                .map(|p| p.id().clone())
                .collect();
            for peer_id in &evict {
                remove_peer_locked(&mut state, peer_id);
            }
            newly_timed_out
        };
        for peer_id in newly_timed_out {
            self.send_timeout(peer_id).await;
        }
    }
}

/// Unpin every requester served by `peer_id`, count each as pending again,
/// signal it to redo, and forget the peer.
///
/// A requester that had not received its block yet is settled back by
/// [`BlockPool::reset_requester`] when it processes the redo.
fn remove_peer_locked(state: &mut PoolState, peer_id: &PeerId) {
    let mut reassigned = 0usize;
    for requester in state.requesters.values_mut() {
        if requester.peer_id.as_ref() == Some(peer_id) {
            requester.peer_id = None;
            requester.redo_pending = true;
            requester.signal(Signal::Redo);
            reassigned += 1;
        }
    }
    state.num_pending += reassigned;
    if state.peers.remove(peer_id).is_some() || reassigned > 0 {
        debug!(peer = %peer_id, reassigned, "removed pool peer");
    }
}
