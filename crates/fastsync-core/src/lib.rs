//! # fastsync-core
//! Foundation types, constants, errors and collaborator traits for fast sync.

pub mod constants;
pub mod error;
pub mod part_set;
pub mod traits;
pub mod types;

pub use error::{CodecError, ExecuteError, PartSetError, StoreError, SyncError, VerifyError};
pub use part_set::{Part, PartSet, PartSetHeader};
pub use traits::{BlockExecutor, BlockStore, BlockVerifier, Transport};
pub use types::{Block, BlockHeader, BlockId, BlockMeta, Commit, CommitSig, Hash256, PeerId};
