//! Business logic for CipherBox: vault lifecycle, folder-metadata
//! sealing, mutable-pointer relay/resolve, the republish scheduler,
//! epoch state, and the storage abstraction both `cipherbox-api` and
//! `cipherbox-signer` build on.
//!
//! Layout mirrors the teacher's `citadel-keystore/src/lib.rs`: one flat
//! module per concern, a single top-level error enum in [`error`], and
//! a storage trait with an in-memory test double living alongside the
//! production abstraction rather than behind a feature flag.

pub mod audit;
pub mod config;
pub mod epoch;
pub mod error;
pub mod rate_limit;
pub mod relay;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod validate;
pub mod vault;

pub use error::CoreError;
