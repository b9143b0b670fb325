//! # fastsync-node — reference collaborators for the sync reactor.
//!
//! - [`store::MemoryBlockStore`] — in-memory block store with an archive boundary
//! - [`verifier::CommitVerifier`] — ed25519 commit verification against a [`ValidatorSet`]
//! - [`executor::StoreExecutor`] — applies synced blocks to a store
//! - [`chain`] — deterministic signed chains for simulation and tests
//! - [`config::NodeConfig`] — node configuration

pub mod chain;
pub mod config;
pub mod executor;
pub mod store;
pub mod verifier;

pub use chain::{ChainBuilder, SignedBlock, Validators};
pub use config::{LogFormat, NodeConfig};
pub use executor::StoreExecutor;
pub use store::MemoryBlockStore;
pub use verifier::{CommitVerifier, ValidatorSet};
