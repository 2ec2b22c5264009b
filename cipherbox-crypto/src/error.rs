//! Error kinds for the cryptographic primitives.

use core::fmt;

/// Failure modes exposed by `cipherbox-crypto`.
///
/// Deliberately coarse: callers one layer up (core) translate these into
/// client-facing error kinds. Never carries key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoKind {
    /// AEAD key was not exactly 32 bytes, or the underlying cipher
    /// rejected the key.
    InvalidKeyLength,
    /// The platform RNG failed to produce randomness.
    RngFailure,
    /// AEAD tag verification failed. Never surfaced with more detail.
    AuthFailure,
    /// A public or private key was malformed (wrong length, wrong
    /// curve point encoding, scalar out of range).
    InvalidKey,
    /// Signature bytes were not a well-formed 65-byte `r||s||v`/recovery
    /// tuple.
    SignatureMalformed,
    /// HKDF output, interpreted as a scalar, fell outside `[1, n)`.
    DerivationRange,
    /// A pointer record could not be parsed.
    InvalidRecord,
    /// Wallet-derivation was called again before the 5s rate-limit
    /// window elapsed.
    RateLimited,
}

impl fmt::Display for CryptoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyLength => write!(f, "invalid key length"),
            Self::RngFailure => write!(f, "random number generation failed"),
            Self::AuthFailure => write!(f, "cannot decrypt"),
            Self::InvalidKey => write!(f, "invalid key"),
            Self::SignatureMalformed => write!(f, "signature malformed"),
            Self::DerivationRange => write!(f, "derived scalar out of range"),
            Self::InvalidRecord => write!(f, "invalid pointer record"),
            Self::RateLimited => write!(f, "derivation rate limit exceeded"),
        }
    }
}

impl std::error::Error for CryptoKind {}

pub type CryptoResult<T> = Result<T, CryptoKind>;
