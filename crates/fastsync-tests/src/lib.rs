//! Integration test suite for fast sync.
//!
//! Tests in `tests/` run whole nodes (store, verifier, executor and reactor)
//! against each other over the in-memory transport, including peers that
//! serve forged blocks, go silent, or disconnect mid-sync.

pub mod helpers;
