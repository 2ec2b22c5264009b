//! AEAD: AES-256-GCM.
//!
//! `key + iv` pairs must never repeat for a given key. Callers are
//! responsible for generating a fresh `iv` per call via [`fresh_iv`].

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;
use zeroize::Zeroizing;

use crate::error::CryptoKind;

/// A sealed AEAD blob: ciphertext with the tag appended, plus the iv
/// used to seal it.
#[derive(Clone, Debug)]
pub struct Sealed {
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Generate a fresh random 12-byte iv.
pub fn fresh_iv() -> Result<[u8; 12], CryptoKind> {
    let mut iv = [0u8; 12];
    getrandom(&mut iv).map_err(|_| CryptoKind::RngFailure)?;
    Ok(iv)
}

/// AEAD encrypt (seal). `key` must be exactly 32 bytes.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoKind> {
    let iv = fresh_iv()?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoKind::InvalidKeyLength)?;
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoKind::InvalidKeyLength)?;
    Ok(Sealed { iv, ciphertext })
}

/// AEAD decrypt (open). Tag is verified before any plaintext is
/// returned; on mismatch, the only signal is [`CryptoKind::AuthFailure`].
pub fn open(
    key: &[u8; 32],
    iv: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoKind> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoKind::InvalidKeyLength)?;
    let nonce = Nonce::from_slice(iv);
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoKind::AuthFailure)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"hello cipherbox", b"aad-context").unwrap();
        let opened = open(&key, &sealed.iv, &sealed.ciphertext, b"aad-context").unwrap();
        assert_eq!(&opened[..], b"hello cipherbox");
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = [7u8; 32];
        let mut sealed = seal(&key, b"hello cipherbox", b"aad").unwrap();
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0x01;
        let err = open(&key, &sealed.iv, &sealed.ciphertext, b"aad").unwrap_err();
        assert_eq!(err, CryptoKind::AuthFailure);
    }

    #[test]
    fn wrong_aad_fails_auth() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"hello cipherbox", b"aad-a").unwrap();
        let err = open(&key, &sealed.iv, &sealed.ciphertext, b"aad-b").unwrap_err();
        assert_eq!(err, CryptoKind::AuthFailure);
    }
}
