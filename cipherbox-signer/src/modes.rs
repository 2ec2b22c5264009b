//! The signer's two operating modes (§4.6): `Simulator` derives epoch
//! keys from a local seed for development; `Attested` would derive them
//! inside a hardware-isolated environment from a platform-bound root.
//! Both expose the same `derive_epoch_keypair` contract, so the rest of
//! the worker never matches on mode — a plain enum, per the design
//! note that no dynamic dispatch is needed here (only one implementation
//! of the derivation exists per process).

use cipherbox_crypto::kdf::hkdf_sha256;
use cipherbox_crypto::{CryptoKind, CryptoResult};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use zeroize::Zeroizing;

/// Domain-separation salt for epoch-keypair derivation. Distinct from
/// the wallet-derivation salt in `cipherbox-crypto::wallet_derivation`.
const EPOCH_SALT: &[u8] = b"cipherbox-signer-epoch-derivation-v1";

pub struct EpochKeypair {
    pub public_key: Vec<u8>,
    pub private_key: Zeroizing<[u8; 32]>,
}

#[derive(Clone)]
pub enum SignerMode {
    /// Epoch keys are HKDF-derived from a local, operator-supplied seed.
    /// Development and test use only — the seed lives in process memory
    /// for the worker's whole lifetime.
    Simulator { seed: Zeroizing<[u8; 32]> },
    /// Epoch keys would be derived inside a hardware-isolated enclave
    /// from a platform-bound root. The attestation handshake and
    /// enclave-local derivation are out of scope for this worker; the
    /// mode exists so callers can match on it without the rest of the
    /// binary changing shape once that integration lands.
    Attested,
}

impl SignerMode {
    pub fn label(&self) -> &'static str {
        match self {
            SignerMode::Simulator { .. } => "simulator",
            SignerMode::Attested => "attested",
        }
    }
}

/// Derive the secp256k1 keypair for `epoch`, deterministically from the
/// mode's root secret. Two calls with the same mode and epoch always
/// return the same keypair — this is what lets the signer be queried
/// for an arbitrary past epoch's public key without having persisted it.
pub fn derive_epoch_keypair(mode: &SignerMode, epoch: u32) -> CryptoResult<EpochKeypair> {
    let seed = match mode {
        SignerMode::Simulator { seed } => seed,
        SignerMode::Attested => return Err(CryptoKind::InvalidKey),
    };

    let info = format!("epoch:{epoch}");
    let derived = hkdf_sha256(EPOCH_SALT, &**seed, info.as_bytes(), 32)?;

    let secret_key = SecretKey::from_slice(&derived).map_err(|_| CryptoKind::DerivationRange)?;
    let public_key = PublicKey::from_secret_key(&Secp256k1::new(), &secret_key);

    let mut private_key = Zeroizing::new([0u8; 32]);
    private_key.copy_from_slice(&derived);

    Ok(EpochKeypair { public_key: public_key.serialize_uncompressed().to_vec(), private_key })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator(byte: u8) -> SignerMode {
        SignerMode::Simulator { seed: Zeroizing::new([byte; 32]) }
    }

    #[test]
    fn same_epoch_derives_identically() {
        let mode = simulator(7);
        let a = derive_epoch_keypair(&mode, 3).unwrap();
        let b = derive_epoch_keypair(&mode, 3).unwrap();
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(&*a.private_key, &*b.private_key);
    }

    #[test]
    fn different_epochs_derive_different_keys() {
        let mode = simulator(7);
        let a = derive_epoch_keypair(&mode, 1).unwrap();
        let b = derive_epoch_keypair(&mode, 2).unwrap();
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn different_seeds_derive_different_keys() {
        let a = derive_epoch_keypair(&simulator(1), 1).unwrap();
        let b = derive_epoch_keypair(&simulator(2), 1).unwrap();
        assert_ne!(a.public_key, b.public_key);
    }
}
