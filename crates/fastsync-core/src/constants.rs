//! Protocol constants for block-pool synchronization.
//!
//! These are fixed values, not derived from chain parameters. The sync layer
//! copies them into its configuration struct so tests can shorten timers.

use std::time::Duration;

/// Pause between peer-selection attempts, and the pool's back-off when it is
/// at capacity.
pub const REQUEST_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum number of requesters alive in the pool at once.
pub const MAX_TOTAL_REQUESTERS: usize = 300;

/// Maximum number of requests awaiting a block across all peers.
pub const MAX_PENDING_REQUESTS: usize = MAX_TOTAL_REQUESTERS;

/// Maximum number of outstanding requests assigned to a single peer.
pub const MAX_PENDING_REQUESTS_PER_PEER: u32 = 75;

/// Receive-rate floor in bytes per second (10 KiB/s).
///
/// A peer with outstanding requests whose smoothed receive rate falls below
/// this value is evicted on the next timeout sweep.
pub const MIN_RECV_RATE: f64 = 10_240.0;

/// Liveness window armed whenever a peer goes from zero to one outstanding
/// request, and re-armed on every response while requests remain.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15);

/// Period of the reactor's verify-and-execute tick.
pub const TRY_SYNC_INTERVAL: Duration = Duration::from_millis(100);

/// Period of the reactor's `StatusRequest` broadcast.
pub const STATUS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Period of the reactor's catch-up check.
pub const SWITCH_TO_CONSENSUS_INTERVAL: Duration = Duration::from_secs(1);

/// A pool still sitting at height 0 must have run this long before it may
/// report itself caught up.
pub const CATCH_UP_MIN_AGE: Duration = Duration::from_secs(5);

/// Upper bound on blocks verified and executed per sync tick.
pub const SYNC_ITERATIONS_PER_TICK: usize = 10;

/// Channel identifier for block-sync traffic.
pub const BLOCKCHAIN_CHANNEL: u8 = 0x40;

/// Capacity of the reactor's request and timeout queues, and of each
/// per-peer send queue in the in-memory transport.
pub const CHANNEL_CAPACITY: usize = 100;

/// Default size of one block part in bytes.
pub const DEFAULT_BLOCK_PART_SIZE: usize = 65_536;

/// Maximum encoded block size in bytes.
pub const MAX_BLOCK_SIZE: usize = 22 * 1024 * 1024;

/// Maximum wire message size (block size plus envelope overhead).
///
/// ```
/// use fastsync_core::constants::{MAX_BLOCK_SIZE, MAX_MESSAGE_SIZE};
/// assert!(MAX_MESSAGE_SIZE > MAX_BLOCK_SIZE);
/// ```
pub const MAX_MESSAGE_SIZE: usize = MAX_BLOCK_SIZE + 1024;
