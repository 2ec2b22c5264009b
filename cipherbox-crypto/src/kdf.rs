//! HKDF-SHA-256 helper, shared by wallet derivation and any future
//! context-bound key derivation.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoKind;

/// Derive `len` bytes via HKDF-SHA-256(salt, ikm, info).
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoKind> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = Zeroizing::new(vec![0u8; len]);
    hk.expand(info, &mut out).map_err(|_| CryptoKind::DerivationRange)?;
    Ok(out)
}
