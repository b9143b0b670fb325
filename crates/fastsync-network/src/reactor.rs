//! The sync reactor: protocol engine between the transport and the pool.
//!
//! Inbound messages are decoded and dispatched to the [`BlockPool`] or
//! answered from the [`BlockStore`]. A single driving loop ([`SyncReactor::run`])
//! forwards the pool's block requests and peer timeouts to the transport,
//! broadcasts status requests, verifies and executes ready blocks in height
//! order, and ends once the pool reports catch-up.

use std::sync::Arc;

use fastsync_core::error::SyncError;
use fastsync_core::traits::{BlockExecutor, BlockStore, BlockVerifier, Transport};
use fastsync_core::types::{BlockId, PeerId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::pool::{BlockPool, PoolStatus};
use crate::protocol::SyncMessage;
use crate::requester::BlockRequest;

/// Fired once when fast sync hands over to consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchToConsensus {
    /// Pool height at the time of the switch: the first height consensus
    /// must produce or receive.
    pub height: u64,
}

/// Snapshot for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorStatus {
    pub pool: PoolStatus,
    pub num_peers: usize,
    pub max_peer_height: u64,
}

struct Receivers {
    requests: mpsc::Receiver<BlockRequest>,
    timeouts: mpsc::Receiver<PeerId>,
}

/// Block-sync reactor.
pub struct SyncReactor {
    config: SyncConfig,
    store: Arc<dyn BlockStore>,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn BlockVerifier>,
    executor: Arc<dyn BlockExecutor>,
    pool: Arc<BlockPool>,
    receivers: Mutex<Option<Receivers>>,
    switch_tx: Mutex<Option<oneshot::Sender<SwitchToConsensus>>>,
    quit: watch::Sender<bool>,
}

impl std::fmt::Debug for SyncReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReactor")
            .field("fast_sync", &self.config.fast_sync)
            .field("store_height", &self.store.height())
            .field("pool", &self.pool)
            .finish()
    }
}

impl SyncReactor {
    /// Build a reactor whose pool starts right above the store's height.
    ///
    /// Returns the reactor and the receiver of the one-shot switch signal.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn BlockStore>,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn BlockVerifier>,
        executor: Arc<dyn BlockExecutor>,
    ) -> (Arc<Self>, oneshot::Receiver<SwitchToConsensus>) {
        let (requests_tx, requests) = mpsc::channel(config.channel_capacity);
        let (timeouts_tx, timeouts) = mpsc::channel(config.channel_capacity);
        let pool = BlockPool::new(store.height() + 1, config.clone(), requests_tx, timeouts_tx);
        let (switch_tx, switch_rx) = oneshot::channel();
        let (quit, _) = watch::channel(false);

        let reactor = Arc::new(Self {
            config,
            store,
            transport,
            verifier,
            executor,
            pool,
            receivers: Mutex::new(Some(Receivers { requests, timeouts })),
            switch_tx: Mutex::new(Some(switch_tx)),
            quit,
        });
        (reactor, switch_rx)
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Peer lifecycle
    // ---------------------------------------------------------------------

    /// A peer connected: tell it our height.
    pub fn add_peer(&self, peer: &PeerId) {
        debug!(%peer, "sync peer added");
        self.send(
            peer,
            &SyncMessage::StatusResponse {
                height: self.store.height(),
            },
        );
    }

    /// A peer disconnected: drop it from the pool and re-queue its work.
    pub fn remove_peer(&self, peer: &PeerId) {
        debug!(%peer, "sync peer removed");
        self.pool.remove_peer(peer);
    }

    // ---------------------------------------------------------------------
    // Inbound dispatch
    // ---------------------------------------------------------------------

    /// Handle one inbound message from `src`.
    ///
    /// Malformed or unknown messages are logged and dropped; the connection
    /// is left alone.
    pub fn receive(&self, channel: u8, src: &PeerId, msg_bytes: &[u8]) {
        if channel != self.config.channel {
            debug!(%src, channel, "ignoring message on foreign channel");
            return;
        }
        let msg = match SyncMessage::decode(msg_bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%src, error = %e, "error decoding sync message");
                return;
            }
        };
        trace!(%src, kind = ?msg.kind(), "sync message received");

        match msg {
            SyncMessage::BlockRequest { height } => self.serve_block(src, height),
            SyncMessage::BlockResponse { block } => {
                self.pool.add_block(src, block, msg_bytes.len());
            }
            SyncMessage::StatusRequest { .. } => {
                self.send(
                    src,
                    &SyncMessage::StatusResponse {
                        height: self.store.height(),
                    },
                );
            }
            SyncMessage::StatusResponse { height } => {
                self.pool.set_peer_height(src, height);
            }
            SyncMessage::BlockHeaderRequest { height } => self.serve_header(src, height),
            SyncMessage::BlockHeaderResponse { header } => {
                debug!(%src, height = header.height, hash = %header.hash(), "received block header");
            }
        }
    }

    fn serve_block(&self, src: &PeerId, height: u64) {
        let loaded = if height > self.store.origin_height() {
            self.store.load_block(height)
        } else {
            self.store.load_archived_block(height)
        };
        match loaded {
            Ok(Some(block)) => {
                self.send(src, &SyncMessage::BlockResponse { block });
            }
            Ok(None) => debug!(%src, height, "peer asked for a block we do not have"),
            Err(e) => warn!(%src, height, error = %e, "failed to load requested block"),
        }
    }

    fn serve_header(&self, src: &PeerId, height: u64) {
        match self.store.load_block_meta(height) {
            Ok(Some(meta)) => {
                self.send(
                    src,
                    &SyncMessage::BlockHeaderResponse {
                        header: meta.header,
                    },
                );
            }
            Ok(None) => debug!(%src, height, "peer asked for a header we do not have"),
            Err(e) => warn!(%src, height, error = %e, "failed to load requested header"),
        }
    }

    /// Encode and queue `msg` for `peer`. A full queue drops the message.
    fn send(&self, peer: &PeerId, msg: &SyncMessage) -> bool {
        match msg.encode() {
            Ok(bytes) => {
                let queued = self.transport.try_send(peer, self.config.channel, bytes);
                if !queued {
                    debug!(%peer, kind = ?msg.kind(), "send queue full or peer gone; dropped");
                }
                queued
            }
            Err(e) => {
                warn!(%peer, error = %e, "failed to encode sync message");
                false
            }
        }
    }

    fn broadcast(&self, msg: &SyncMessage) {
        match msg.encode() {
            Ok(bytes) => self.transport.broadcast(self.config.channel, bytes),
            Err(e) => warn!(error = %e, "failed to encode sync broadcast"),
        }
    }

    pub fn broadcast_status_request(&self) {
        self.broadcast(&SyncMessage::StatusRequest {
            height: self.store.height(),
        });
    }

    pub fn broadcast_status_response(&self) {
        self.broadcast(&SyncMessage::StatusResponse {
            height: self.store.height(),
        });
    }

    pub fn get_status(&self) -> ReactorStatus {
        ReactorStatus {
            pool: self.pool.get_status(),
            num_peers: self.transport.num_peers(),
            max_peer_height: self.pool.max_peer_height(),
        }
    }

    /// Stop the driving loop and the pool.
    pub fn stop(&self) {
        self.quit.send_replace(true);
        self.pool.stop();
    }

    // ---------------------------------------------------------------------
    // Driving loop
    // ---------------------------------------------------------------------

    /// Run fast sync until catch-up, [`stop`](Self::stop), or a fatal error.
    ///
    /// With fast sync disabled this returns immediately; the reactor keeps
    /// serving peers through [`receive`](Self::receive).
    pub async fn run(self: &Arc<Self>) -> Result<(), SyncError> {
        if !self.config.fast_sync {
            info!("fast sync disabled; serving blocks only");
            return Ok(());
        }
        let Some(Receivers {
            mut requests,
            mut timeouts,
        }) = self.receivers.lock().take()
        else {
            return Err(SyncError::AlreadyRunning);
        };

        self.pool.start();
        info!(height = self.pool.get_status().height, "fast sync started");

        let mut try_sync_ticker = ticker(self.config.try_sync_interval);
        let mut status_ticker = ticker(self.config.status_update_interval);
        let mut switch_ticker = ticker(self.config.switch_to_consensus_interval);
        let mut quit = self.quit.subscribe();

        let result = loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    self.send(&request.peer_id, &SyncMessage::BlockRequest { height: request.height });
                }
                Some(peer) = timeouts.recv() => {
                    warn!(%peer, "disconnecting timed-out peer");
                    self.transport.disconnect(&peer, "block sync timeout");
                }
                _ = status_ticker.tick() => {
                    self.broadcast_status_request();
                }
                _ = switch_ticker.tick() => {
                    let status = self.get_status();
                    debug!(
                        height = status.pool.height,
                        num_pending = status.pool.num_pending,
                        num_requesters = status.pool.num_requesters,
                        num_peers = status.num_peers,
                        "consensus switch check"
                    );
                    if self.pool.is_caught_up() {
                        info!(height = status.pool.height, "caught up; switching to consensus");
                        self.pool.stop();
                        if let Some(tx) = self.switch_tx.lock().take() {
                            let _ = tx.send(SwitchToConsensus { height: status.pool.height });
                        }
                        break Ok(());
                    }
                }
                _ = try_sync_ticker.tick() => {
                    if let Err(e) = self.try_sync() {
                        error!(error = %e, "fatal fast sync error");
                        break Err(e);
                    }
                }
                _ = quit.wait_for(|stopped| *stopped) => {
                    info!("fast sync stopped");
                    break Ok(());
                }
            }
        };
        self.pool.stop();
        result
    }

    /// Verify and execute up to `sync_iterations_per_tick` ready blocks.
    pub(crate) fn try_sync(&self) -> Result<(), SyncError> {
        for _ in 0..self.config.sync_iterations_per_tick {
            let (Some(first), Some(second)) = self.pool.peek_two_blocks() else {
                break;
            };
            let height = first.height();
            let parts = first
                .make_part_set(self.config.block_part_size)
                .map_err(|source| SyncError::PartSet { height, source })?;
            let block_id = BlockId {
                hash: first.hash(),
                parts_header: parts.header(),
            };

            if let Err(e) = self.verifier.verify(&block_id, height, &second.last_commit) {
                warn!(height, error = %e, "block failed verification");
                if let Some(peer) = self.pool.redo_request(height)? {
                    self.transport.disconnect(&peer, "served a block that failed verification");
                }
                break;
            }

            self.pool.pop_request()?;
            self.executor
                .execute(&first, &parts, &second.last_commit)
                .map_err(|source| {
                    let hash = first.hash().to_string();
                    error!(height, %hash, error = %source, "failed to process committed block");
                    SyncError::Execution {
                        height,
                        hash,
                        source,
                    }
                })?;
            debug!(height, "block synced");
        }
        Ok(())
    }
}

/// Interval whose first tick is one full period away.
fn ticker(period: std::time::Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
