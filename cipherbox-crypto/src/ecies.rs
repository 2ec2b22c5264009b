//! ECIES key wrap/unwrap over secp256k1.
//!
//! `Wrap` encrypts a 32-byte symmetric key to a recipient's uncompressed
//! public key; `Unwrap` reverses it with the recipient's private key.
//! Framing is `ephemeral_pub || iv || ciphertext || tag`, produced by the
//! `ecies` crate's own encode/decode.

use zeroize::Zeroizing;

use crate::error::CryptoKind;

/// Uncompressed secp256k1 public key size (`0x04 || x[32] || y[32]`).
pub const SECP256K1_PUBLIC_KEY_SIZE: usize = 65;
/// secp256k1 private key / symmetric key size.
pub const SECP256K1_PRIVATE_KEY_SIZE: usize = 32;
/// Smallest plausible ECIES envelope: ephemeral pubkey + iv + tag, no
/// plaintext.
pub const ECIES_MIN_CIPHERTEXT_SIZE: usize = 65 + 16 + 16;

/// Wrap a 32-byte symmetric key under a recipient's uncompressed
/// secp256k1 public key.
pub fn wrap_key(recipient_public_key: &[u8], symmetric_key: &[u8; 32]) -> Result<Vec<u8>, CryptoKind> {
    validate_public_key(recipient_public_key)?;
    ecies::encrypt(recipient_public_key, symmetric_key).map_err(|_| CryptoKind::InvalidKey)
}

/// Unwrap a previously-wrapped symmetric key using the recipient's
/// 32-byte secp256k1 private key.
pub fn unwrap_key(
    recipient_private_key: &[u8; 32],
    wrapped: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoKind> {
    if wrapped.len() < ECIES_MIN_CIPHERTEXT_SIZE {
        return Err(CryptoKind::AuthFailure);
    }
    let plaintext = ecies::decrypt(recipient_private_key, wrapped).map_err(|_| CryptoKind::AuthFailure)?;
    if plaintext.len() != SECP256K1_PRIVATE_KEY_SIZE {
        return Err(CryptoKind::AuthFailure);
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&plaintext);
    Ok(out)
}

fn validate_public_key(bytes: &[u8]) -> Result<(), CryptoKind> {
    if bytes.len() != SECP256K1_PUBLIC_KEY_SIZE || bytes[0] != 0x04 {
        return Err(CryptoKind::InvalidKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (Vec<u8>, [u8; 32]) {
        let (sk, pk) = ecies::utils::generate_keypair();
        let mut sk_bytes = [0u8; 32];
        sk_bytes.copy_from_slice(&sk.serialize());
        (pk.serialize().to_vec(), sk_bytes)
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let (pk, sk) = keypair();
        let symmetric_key = [42u8; 32];
        let wrapped = wrap_key(&pk, &symmetric_key).unwrap();
        let unwrapped = unwrap_key(&sk, &wrapped).unwrap();
        assert_eq!(&*unwrapped, &symmetric_key);
    }

    #[test]
    fn rejects_compressed_public_key() {
        let mut bad = vec![0x02u8];
        bad.extend_from_slice(&[0u8; 32]);
        let err = wrap_key(&bad, &[1u8; 32]).unwrap_err();
        assert_eq!(err, CryptoKind::InvalidKey);
    }

    #[test]
    fn rejects_short_wrapped_blob() {
        let (_, sk) = keypair();
        let err = unwrap_key(&sk, &[0u8; 10]).unwrap_err();
        assert_eq!(err, CryptoKind::AuthFailure);
    }
}
