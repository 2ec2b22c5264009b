//! Error kinds for `cipherbox-core`, and the per-operation wrapper errors
//! that the API boundary maps onto HTTP status codes.

use std::fmt;

use cipherbox_crypto::CryptoKind;

/// Top-level error kind shared across vault, relay, scheduler, and epoch
/// operations. Never carries key material or wrapped-ciphertext payloads.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// DTO-level validation failure, returned to the client.
    InvalidInput(String),
    /// Identity could not be established.
    Unauthenticated,
    /// Identity established but lacks the right to perform this operation.
    Forbidden,
    /// AEAD/ECIES failure. Never surfaced with more detail than "cannot decrypt".
    AuthFailure,
    /// A mutable-pointer record failed to parse.
    InvalidRecord(String),
    /// The content network was unreachable after retries.
    UpstreamUnavailable(String),
    /// A local rate gate was hit.
    RateLimited,
    /// Per-user storage quota exceeded.
    QuotaExceeded,
    /// The TEE signer could not be reached.
    SignerUnavailable(String),
    /// A requested resource does not exist.
    NotFound,
    /// Internal-only: derived scalar landed outside the valid range.
    DerivationRange,
    /// Non-recoverable: schema mismatch, misconfiguration at boot.
    Fatal(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::AuthFailure => write!(f, "cannot decrypt"),
            Self::InvalidRecord(msg) => write!(f, "invalid pointer record: {msg}"),
            Self::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::QuotaExceeded => write!(f, "quota exceeded"),
            Self::SignerUnavailable(msg) => write!(f, "signer unavailable: {msg}"),
            Self::NotFound => write!(f, "not found"),
            Self::DerivationRange => write!(f, "derived scalar out of range"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<CryptoKind> for CoreError {
    fn from(kind: CryptoKind) -> Self {
        match kind {
            CryptoKind::AuthFailure => Self::AuthFailure,
            CryptoKind::InvalidRecord => Self::InvalidRecord(kind.to_string()),
            CryptoKind::DerivationRange => Self::DerivationRange,
            CryptoKind::RateLimited => Self::RateLimited,
            CryptoKind::InvalidKeyLength
            | CryptoKind::RngFailure
            | CryptoKind::InvalidKey
            | CryptoKind::SignatureMalformed => Self::InvalidInput(kind.to_string()),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Fatal(format!("storage: {e}"))
    }
}

/// A macro for the small newtype wrapper errors the teacher uses
/// (`GenerateError`, `LifecycleError`, ...): a single tuple field around
/// [`CoreError`], `Display` delegating, and a blanket `From<CoreError>`.
macro_rules! wrapper_error {
    ($name:ident) => {
        #[derive(Debug, Clone)]
        pub struct $name(pub CoreError);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::error::Error for $name {}

        impl From<CoreError> for $name {
            fn from(e: CoreError) -> Self {
                Self(e)
            }
        }
    };
}

wrapper_error!(VaultError);
wrapper_error!(PublishError);
wrapper_error!(ResolveError);
wrapper_error!(ScheduleError);
wrapper_error!(EpochError);
