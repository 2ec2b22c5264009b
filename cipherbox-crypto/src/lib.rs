//! Cryptographic primitives for CipherBox.
//!
//! Four independent layers, composed by `cipherbox-core`, never by
//! anything outside this crate touching raw key bytes directly:
//!
//! - [`aead`] — AES-256-GCM sealing of file and folder-metadata bytes.
//! - [`ecies`] — secp256k1 ECIES key-wrap for the folder/root key chain.
//! - [`signing`] — Ed25519 pointer-signing keys and the mutable-pointer
//!   wire format.
//! - [`wallet_derivation`] — deterministic pointer-seed derivation from
//!   a wallet signature, with malleability-resistant normalization.
//! - [`kdf`] — the shared HKDF-SHA-256 primitive the above build on.
//!
//! Every function that hands back key material wraps it in
//! [`zeroize::Zeroizing`]; nothing in this crate logs a key, a seed, or
//! a derived scalar.

pub mod aead;
pub mod ecies;
pub mod error;
pub mod kdf;
pub mod signing;
pub mod wallet_derivation;

pub use error::{CryptoKind, CryptoResult};
