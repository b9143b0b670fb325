//! Configuration for the block pool and sync reactor.

use fastsync_core::constants::{
    BLOCKCHAIN_CHANNEL, CATCH_UP_MIN_AGE, CHANNEL_CAPACITY, DEFAULT_BLOCK_PART_SIZE,
    MAX_PENDING_REQUESTS, MAX_PENDING_REQUESTS_PER_PEER, MAX_TOTAL_REQUESTERS, MIN_RECV_RATE,
    PEER_TIMEOUT, REQUEST_INTERVAL, STATUS_UPDATE_INTERVAL, SWITCH_TO_CONSENSUS_INTERVAL,
    SYNC_ITERATIONS_PER_TICK, TRY_SYNC_INTERVAL,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a fast-sync node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the catch-up loop at all. When false the reactor only serves peers.
    pub fast_sync: bool,
    /// Channel id all sync messages travel on.
    pub channel: u8,
    /// Size of one block part when rebuilding part sets for execution.
    pub block_part_size: usize,
    /// Back-off between peer-selection attempts and at pool capacity.
    pub request_interval: Duration,
    /// Maximum live requesters.
    pub max_total_requesters: usize,
    /// Maximum requests awaiting a block.
    pub max_pending_requests: usize,
    /// Maximum requests assigned to one peer.
    pub max_pending_per_peer: u32,
    /// Receive-rate floor in bytes per second.
    pub min_recv_rate: f64,
    /// Liveness window for a peer with outstanding requests.
    pub peer_timeout: Duration,
    /// Verify-and-execute tick.
    pub try_sync_interval: Duration,
    /// Status broadcast period.
    pub status_update_interval: Duration,
    /// Catch-up check period.
    pub switch_to_consensus_interval: Duration,
    /// Minimum pool age before an empty pool may report catch-up.
    pub catch_up_min_age: Duration,
    /// Blocks verified and executed per sync tick at most.
    pub sync_iterations_per_tick: usize,
    /// Capacity of the reactor's request and timeout queues.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fast_sync: true,
            channel: BLOCKCHAIN_CHANNEL,
            block_part_size: DEFAULT_BLOCK_PART_SIZE,
            request_interval: REQUEST_INTERVAL,
            max_total_requesters: MAX_TOTAL_REQUESTERS,
            max_pending_requests: MAX_PENDING_REQUESTS,
            max_pending_per_peer: MAX_PENDING_REQUESTS_PER_PEER,
            min_recv_rate: MIN_RECV_RATE,
            peer_timeout: PEER_TIMEOUT,
            try_sync_interval: TRY_SYNC_INTERVAL,
            status_update_interval: STATUS_UPDATE_INTERVAL,
            switch_to_consensus_interval: SWITCH_TO_CONSENSUS_INTERVAL,
            catch_up_min_age: CATCH_UP_MIN_AGE,
            sync_iterations_per_tick: SYNC_ITERATIONS_PER_TICK,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Preset for tests and simulations: short timers, small parts.
    ///
    /// The receive-rate floor is disabled because in-memory links deliver
    /// bursts rather than a steady stream.
    pub fn testing() -> Self {
        Self {
            block_part_size: 4096,
            request_interval: Duration::from_millis(20),
            min_recv_rate: 0.0,
            peer_timeout: Duration::from_secs(2),
            try_sync_interval: Duration::from_millis(10),
            status_update_interval: Duration::from_millis(500),
            switch_to_consensus_interval: Duration::from_millis(100),
            catch_up_min_age: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Preset for a node that only serves blocks to others.
    pub fn serving_only() -> Self {
        Self {
            fast_sync: false,
            ..Self::default()
        }
    }
}
