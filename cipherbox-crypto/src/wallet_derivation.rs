//! Deterministic derivation of a secp256k1 wrapping keypair from an
//! externally-produced wallet signature (§4.2).
//!
//! The server never holds a user's wallet private key. Instead, the
//! client asks the wallet to sign a fixed, human-readable message; the
//! signature itself (not the wallet key) is the input to an HKDF that
//! produces a 32-byte scalar. Two signatures over the same message
//! always normalize to the same scalar, so the derivation is replayable
//! without persisting anything beyond the user's public wallet address.
//!
//! This derives the user's *wrapping* keypair (secp256k1, for ECIES
//! wrap/unwrap of folder/root keys) — not a pointer-signing keypair,
//! which is plain random Ed25519 per [`crate::signing`].

use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use secp256k1::constants::CURVE_ORDER;
use secp256k1::ecdsa::Signature as EcdsaSignature;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use zeroize::Zeroizing;

use crate::error::CryptoKind;
use crate::kdf::hkdf_sha256;

/// Minimum spacing between derivation calls, process-wide.
const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Domain-separation salt for the derivation HKDF. Distinct from any
/// other HKDF use in this crate.
const DERIVATION_SALT: &[u8] = b"cipherbox-wallet-derivation-v1";

/// How many distinct `info` suffixes to try before giving up on an
/// out-of-range scalar (§4.2 step 4). One real signature in 2^128 or so
/// would ever need a second attempt; this bound exists purely so the
/// function can't loop forever.
const MAX_DERIVATION_ATTEMPTS: u8 = 4;

/// A deterministically-derived secp256k1 wrapping keypair (§4.2 step 5),
/// used for ECIES wrap/unwrap (§4.1), not for pointer signing.
pub struct WrappingKeypair {
    /// Uncompressed 65-byte public key (`0x04 || x[32] || y[32]`).
    pub public_key: Vec<u8>,
    pub private_key: Zeroizing<[u8; 32]>,
}

fn rate_limit_state() -> &'static Mutex<Option<Instant>> {
    static STATE: OnceLock<Mutex<Option<Instant>>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(None))
}

/// Build the fixed message a wallet must sign to authorize key
/// derivation for `user_id` under derivation version `derivation_version`.
/// No timestamp, no nonce: determinism is required since the derived
/// keypair *is* the vault's identity. Bumping `derivation_version`
/// deliberately yields a different keypair.
pub fn derivation_message(user_id: &str, derivation_version: u32) -> String {
    format!(
        "CipherBox wrapping-key derivation\nAddress: {}\nPurpose: authorize this device to derive your CipherBox vault key. This signs no transaction and transfers no funds.\nVersion: {derivation_version}",
        user_id.to_lowercase()
    )
}

/// Derive the user's wrapping keypair (§4.2) from a 65-byte ECDSA
/// signature over [`derivation_message`]. Enforces the process-wide
/// rate limit exactly once per call, then internally retries the HKDF
/// with a perturbed `info` suffix (step 4) if the derived scalar lands
/// outside `[1, n)` — this never re-asks the wallet to sign.
pub fn derive_wrapping_keypair(signature_bytes: &[u8], user_id: &str) -> Result<WrappingKeypair, CryptoKind> {
    check_rate_limit()?;

    let rs = extract_rs(signature_bytes)?;
    let normalized_rs = normalize_low_s(&rs)?;

    let mut last_err = CryptoKind::DerivationRange;
    for attempt in 0..MAX_DERIVATION_ATTEMPTS {
        match derive_scalar_seed(&normalized_rs, user_id, attempt) {
            Ok(seed) => {
                let secret_key = SecretKey::from_slice(&*seed).map_err(|_| CryptoKind::DerivationRange)?;
                let public_key = PublicKey::from_secret_key(&Secp256k1::new(), &secret_key);
                return Ok(WrappingKeypair {
                    public_key: public_key.serialize_uncompressed().to_vec(),
                    private_key: seed,
                });
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn check_rate_limit() -> Result<(), CryptoKind> {
    let mut guard = rate_limit_state().lock().expect("rate limit mutex poisoned");
    let now = Instant::now();
    if let Some(last) = *guard {
        if now.duration_since(last) < RATE_LIMIT_INTERVAL {
            return Err(CryptoKind::RateLimited);
        }
    }
    *guard = Some(now);
    Ok(())
}

/// Derive a 32-byte scalar seed from an already low-s-normalized `r||s`.
/// `info_suffix` is appended to the lowercased `user_id` info string so
/// a retry (§4.2 step 4) lands on a distinct HKDF output.
fn derive_scalar_seed(normalized_rs: &[u8; 64], user_id: &str, info_suffix: u8) -> Result<Zeroizing<[u8; 32]>, CryptoKind> {
    let mut info = user_id.to_lowercase().into_bytes();
    info.push(info_suffix);
    let derived = hkdf_sha256(DERIVATION_SALT, normalized_rs, &info, 32)?;

    validate_scalar_range(&derived)?;

    let mut seed = Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(&derived);
    Ok(seed)
}

/// Pull the raw `r || s` bytes out of a 65-byte signature, discarding
/// the trailing recovery byte. Exactly 65 bytes is required: a wallet
/// signature always carries the recovery id, and accepting a bare
/// 64-byte `r||s` would admit signatures no wallet actually produces.
fn extract_rs(signature_bytes: &[u8]) -> Result<[u8; 64], CryptoKind> {
    let rs_slice = match signature_bytes.len() {
        65 => &signature_bytes[..64],
        _ => return Err(CryptoKind::SignatureMalformed),
    };
    let mut rs = [0u8; 64];
    rs.copy_from_slice(rs_slice);
    Ok(rs)
}

/// Normalize `s` to its low-s form (`s' = min(s, n - s)`), so that the
/// two ECDSA-malleable variants of a signature derive the same seed.
fn normalize_low_s(rs: &[u8; 64]) -> Result<[u8; 64], CryptoKind> {
    let signature = EcdsaSignature::from_compact(rs).map_err(|_| CryptoKind::SignatureMalformed)?;
    let mut normalized = signature;
    normalized.normalize_s();

    let mut out = [0u8; 64];
    out.copy_from_slice(&normalized.serialize_compact());
    Ok(out)
}

/// Reject a derived scalar that falls outside `[1, n)`, where `n` is
/// the secp256k1 group order. HKDF output is effectively uniform over
/// 256 bits, so this only ever rejects the astronomically unlikely
/// all-zero or overflow case — but the check must exist because an
/// out-of-range scalar would make the corresponding keypair invalid.
fn validate_scalar_range(scalar: &[u8]) -> Result<(), CryptoKind> {
    if scalar.len() != 32 || scalar.iter().all(|&b| b == 0) {
        return Err(CryptoKind::DerivationRange);
    }
    if scalar.as_ref() >= CURVE_ORDER.as_slice() {
        return Err(CryptoKind::DerivationRange);
    }
    Ok(())
}

// TODO: the client signs `derivation_message` as a plain personal-sign
// payload rather than EIP-712 typed data, so there is currently no
// end-to-end recovery check that the signature actually came from the
// claimed address. Re-enable `secp256k1_ecdsa_recover`-based
// verification here once the upstream EIP-712 hashing ambiguity for
// this message shape is resolved; until then only format validation
// runs, which is all the downstream HKDF actually depends on.
