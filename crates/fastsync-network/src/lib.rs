//! # fastsync-network — block pool, requesters and the sync reactor.
//!
//! A node that is behind its peers downloads blocks in parallel through the
//! [`BlockPool`], verifies each one against the commit carried by its
//! successor, applies it, and hands off to consensus once caught up. The
//! [`SyncReactor`] owns the pool and speaks the wire protocol in [`protocol`].
//!
//! The transport is abstract ([`fastsync_core::traits::Transport`]);
//! [`memory`] provides an in-process implementation for tests and
//! simulation.

pub mod config;
pub mod flowrate;
pub mod memory;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod reactor;
pub mod requester;

pub use config::SyncConfig;
pub use flowrate::RateMonitor;
pub use memory::{drive, MemoryNetwork, MemoryTransport, NetworkEvent};
pub use peer::PoolPeer;
pub use pool::{BlockPool, PoolStatus};
pub use protocol::{Envelope, MessageType, SyncMessage};
pub use reactor::{ReactorStatus, SwitchToConsensus, SyncReactor};
pub use requester::BlockRequest;
