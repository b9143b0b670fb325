//! Ed25519 commit verification against a fixed validator set.

use std::collections::BTreeSet;

use ed25519_dalek::{Signature, VerifyingKey};
use fastsync_core::error::VerifyError;
use fastsync_core::traits::BlockVerifier;
use fastsync_core::types::{BlockId, Commit};

/// Ordered set of validator keys. A signature's `validator_index` indexes
/// into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    keys: Vec<VerifyingKey>,
}

impl ValidatorSet {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&VerifyingKey> {
        self.keys.get(index as usize)
    }

    /// Smallest number of signers that is strictly more than two thirds.
    pub fn quorum(&self) -> usize {
        self.keys.len() * 2 / 3 + 1
    }
}

/// Accepts a commit iff it is for the expected height and block id and
/// carries valid signatures from more than two thirds of the validators.
///
/// Any malformed, unknown, duplicate or invalid signature rejects the
/// commit outright.
#[derive(Debug, Clone)]
pub struct CommitVerifier {
    chain_id: String,
    validators: ValidatorSet,
}

impl CommitVerifier {
    pub fn new(chain_id: impl Into<String>, validators: ValidatorSet) -> Self {
        Self {
            chain_id: chain_id.into(),
            validators,
        }
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }
}

impl BlockVerifier for CommitVerifier {
    fn verify(&self, block_id: &BlockId, height: u64, commit: &Commit) -> Result<(), VerifyError> {
        if commit.height != height {
            return Err(VerifyError::HeightMismatch {
                expected: height,
                got: commit.height,
            });
        }
        if commit.block_id != *block_id {
            return Err(VerifyError::BlockIdMismatch);
        }

        let msg = commit.sign_bytes(&self.chain_id);
        let mut signers = BTreeSet::new();
        for sig in &commit.signatures {
            let index = sig.validator_index;
            let key = self
                .validators
                .get(index)
                .ok_or(VerifyError::UnknownValidator(index))?;
            if !signers.insert(index) {
                return Err(VerifyError::DuplicateSignature(index));
            }
            let signature = Signature::from_slice(&sig.signature)
                .map_err(|_| VerifyError::InvalidSignature(index))?;
            key.verify_strict(&msg, &signature)
                .map_err(|_| VerifyError::InvalidSignature(index))?;
        }

        let total = self.validators.len();
        if signers.len() < self.validators.quorum() {
            return Err(VerifyError::InsufficientVotingPower {
                signed: signers.len(),
                total,
            });
        }
        Ok(())
    }
}
