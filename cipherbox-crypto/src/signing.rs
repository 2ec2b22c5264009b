//! Ed25519 pointer-signing keys, the mutable-pointer record wire format,
//! and pointer-ID derivation.
//!
//! The record envelope is a small hand-rolled protobuf (libp2p's IPNS
//! record shape): field tags below match the real libp2p IPNS record so
//! a CipherBox pointer record looks, on the wire, exactly like one.
//!
//! ```text
//! field 1: Value          (bytes)    "/content/<content_id>"
//! field 2: signatureV1     (bytes)   unused, kept empty for wire shape
//! field 3: ValidityType    (varint)  0 = EOL
//! field 4: Validity        (bytes)   RFC3339 deadline
//! field 5: Sequence        (varint)
//! field 6: TTL             (varint)  unused, kept 0
//! field 7: PubKey          (bytes)   libp2p-wrapped Ed25519 public key
//! field 8: signatureV2     (bytes)
//! field 9: Data            (bytes)   CBOR of {Value, ValidityType, Validity, Sequence}
//! ```

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoKind;

/// Canonical libp2p protobuf prefix for a raw Ed25519 public key:
/// `Type = Ed25519 (1)`, `Data = key[32]`.
const LIBP2P_ED25519_PREFIX: [u8; 4] = [0x08, 0x01, 0x12, 0x20];

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// An Ed25519 pointer-signing keypair.
pub struct PointerKeypair {
    signing_key: SigningKey,
}

impl PointerKeypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from a 32-byte seed (e.g. after ECIES-unwrapping one).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed. Caller is responsible for zeroizing once done.
    pub fn seed_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// The raw 32-byte Ed25519 public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// This keypair's pointer ID (CIDv1, base36, identity-multihash of
    /// the libp2p-wrapped public key).
    pub fn pointer_id(&self) -> String {
        derive_pointer_id(&self.public_key_bytes())
    }

    fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(data).to_bytes()
    }
}

// ---------------------------------------------------------------------------
// libp2p public-key wrapping
// ---------------------------------------------------------------------------

/// Wrap a raw Ed25519 public key in the canonical libp2p `PublicKey`
/// protobuf envelope.
pub fn encode_libp2p_public_key(raw_key: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(36);
    out.extend_from_slice(&LIBP2P_ED25519_PREFIX);
    out.extend_from_slice(raw_key);
    out
}

/// Extract a raw Ed25519 public key from a libp2p-wrapped blob. Returns
/// `None` unless the wrapping is *exactly* the canonical Ed25519 prefix
/// followed by 32 bytes.
pub fn decode_libp2p_public_key(wrapped: &[u8]) -> Option<[u8; 32]> {
    if wrapped.len() != 36 || wrapped[..4] != LIBP2P_ED25519_PREFIX {
        return None;
    }
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&wrapped[4..]);
    Some(raw)
}

// ---------------------------------------------------------------------------
// Pointer ID derivation (CIDv1, base36, identity multihash)
// ---------------------------------------------------------------------------

/// Derive the base36 CIDv1 pointer ID for a raw Ed25519 public key.
pub fn derive_pointer_id(raw_key: &[u8; 32]) -> String {
    let wrapped = encode_libp2p_public_key(raw_key);

    // Identity multihash: code 0x00, length-prefixed, raw bytes.
    let mut multihash = Vec::with_capacity(2 + wrapped.len());
    multihash.extend(encode_varint(0x00));
    multihash.extend(encode_varint(wrapped.len() as u64));
    multihash.extend_from_slice(&wrapped);

    // CIDv1: version(1) || codec(libp2p-key = 0x72) || multihash.
    let mut cid = Vec::with_capacity(2 + multihash.len());
    cid.extend(encode_varint(0x01));
    cid.extend(encode_varint(0x72));
    cid.extend(multihash);

    format!("k{}", encode_base36(&cid))
}

/// Validate a pointer ID against the bounded character set/length a
/// mutable-pointer identifier may take: base36 alphabet, `k` prefix,
/// 50–62 characters total.
pub fn validate_pointer_id(pointer_id: &str) -> bool {
    let len = pointer_id.len();
    if !(50..=62).contains(&len) {
        return false;
    }
    let mut chars = pointer_id.chars();
    match chars.next() {
        Some('k') => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Varint (protobuf-style LEB128, unsigned)
// ---------------------------------------------------------------------------

pub fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out
}

pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

fn encode_base36(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let leading_zeros = bytes.iter().take_while(|&&b| b == 0).count();
    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 36) as u8;
            carry = value / 36;
        }
        while carry > 0 {
            digits.push((carry % 36) as u8);
            carry /= 36;
        }
    }

    let mut out = String::with_capacity(leading_zeros + digits.len());
    out.extend(std::iter::repeat('0').take(leading_zeros));
    for &digit in digits.iter().rev() {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

// ---------------------------------------------------------------------------
// Pointer record: signed fields, marshal, parse
// ---------------------------------------------------------------------------

/// The fields that get signed, CBOR-encoded into the record's `Data`
/// field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedFields {
    #[serde(rename = "Value")]
    pub value: Vec<u8>,
    #[serde(rename = "ValidityType")]
    pub validity_type: u8,
    #[serde(rename = "Validity")]
    pub validity: Vec<u8>,
    #[serde(rename = "Sequence")]
    pub sequence: u64,
}

/// A fully assembled pointer record, ready to marshal to bytes or
/// already parsed from them.
#[derive(Clone, Debug)]
pub struct PointerRecord {
    pub value: Vec<u8>,
    pub sequence: u64,
    pub validity: Vec<u8>,
    pub validity_type: u8,
    /// Present only all together: signature, CBOR data, wrapped pubkey.
    pub verification: Option<VerificationBundle>,
}

#[derive(Clone, Debug)]
pub struct VerificationBundle {
    pub signature: Vec<u8>,
    pub data: Vec<u8>,
    pub pub_key: Vec<u8>,
}

/// Domain-separation prefix for the bytes actually signed. Binds the
/// signature to this record format rather than any externally-defined
/// envelope.
const SIGNING_DOMAIN: &[u8] = b"cipherbox-pointer-record-v1:";

/// Sign and marshal a pointer record to bytes.
pub fn sign_and_marshal_record(
    keypair: &PointerKeypair,
    value: &[u8],
    sequence: u64,
    validity: &[u8],
    validity_type: u8,
) -> Result<Vec<u8>, CryptoKind> {
    let fields = SignedFields {
        value: value.to_vec(),
        validity_type,
        validity: validity.to_vec(),
        sequence,
    };

    let mut data = Vec::new();
    ciborium::into_writer(&fields, &mut data).map_err(|_| CryptoKind::InvalidRecord)?;

    let mut to_sign = Vec::with_capacity(SIGNING_DOMAIN.len() + data.len());
    to_sign.extend_from_slice(SIGNING_DOMAIN);
    to_sign.extend_from_slice(&data);
    let signature = keypair.sign(&to_sign);

    let pub_key = encode_libp2p_public_key(&keypair.public_key_bytes());

    Ok(marshal_record(&PointerRecord {
        value: value.to_vec(),
        sequence,
        validity: validity.to_vec(),
        validity_type,
        verification: Some(VerificationBundle {
            signature: signature.to_vec(),
            data,
            pub_key,
        }),
    }))
}

/// Marshal a pointer record's fields to the protobuf-ish wire format.
pub fn marshal_record(record: &PointerRecord) -> Vec<u8> {
    let mut out = Vec::new();

    push_bytes_field(&mut out, 1, &record.value);
    push_bytes_field(&mut out, 2, &[]); // signatureV1: unused
    push_varint_field(&mut out, 3, record.validity_type as u64);
    push_bytes_field(&mut out, 4, &record.validity);
    push_varint_field(&mut out, 5, record.sequence);
    push_varint_field(&mut out, 6, 0); // TTL: unused

    if let Some(bundle) = &record.verification {
        push_bytes_field(&mut out, 7, &bundle.pub_key);
        push_bytes_field(&mut out, 8, &bundle.signature);
        push_bytes_field(&mut out, 9, &bundle.data);
    }

    out
}

/// Parse a marshaled pointer record.
///
/// All-or-nothing: if any of `{signature, data, pubkey}` cannot be fully
/// recovered, `verification` is `None` even if some of the three parsed
/// — the caller must never see a partially populated bundle.
pub fn parse_record(bytes: &[u8]) -> Result<PointerRecord, CryptoKind> {
    let mut value = None;
    let mut sequence = None;
    let mut validity = None;
    let mut validity_type = None;
    let mut pub_key = None;
    let mut signature = None;
    let mut data = None;

    let mut offset = 0;
    while offset < bytes.len() {
        let (tag, tag_len) = decode_varint(&bytes[offset..]).ok_or(CryptoKind::InvalidRecord)?;
        offset += tag_len;
        let field_num = tag >> 3;
        let wire_type = tag & 0x7;

        match wire_type {
            0 => {
                let (v, n) = decode_varint(&bytes[offset..]).ok_or(CryptoKind::InvalidRecord)?;
                offset += n;
                match field_num {
                    3 => validity_type = Some(v as u8),
                    5 => sequence = Some(v),
                    _ => {}
                }
            }
            2 => {
                let (len, n) = decode_varint(&bytes[offset..]).ok_or(CryptoKind::InvalidRecord)?;
                offset += n;
                let len = len as usize;
                if offset + len > bytes.len() {
                    return Err(CryptoKind::InvalidRecord);
                }
                let slice = bytes[offset..offset + len].to_vec();
                offset += len;
                match field_num {
                    1 => value = Some(slice),
                    4 => validity = Some(slice),
                    7 => pub_key = Some(slice),
                    8 => signature = Some(slice),
                    9 => data = Some(slice),
                    _ => {}
                }
            }
            _ => return Err(CryptoKind::InvalidRecord),
        }
    }

    let value = value.ok_or(CryptoKind::InvalidRecord)?;
    let sequence = sequence.ok_or(CryptoKind::InvalidRecord)?;

    let verification = match (signature, data, pub_key) {
        (Some(signature), Some(data), Some(pub_key)) => Some(VerificationBundle { signature, data, pub_key }),
        _ => None,
    };

    Ok(PointerRecord {
        value,
        sequence,
        validity: validity.unwrap_or_default(),
        validity_type: validity_type.unwrap_or(0),
        verification,
    })
}

fn push_varint_field(out: &mut Vec<u8>, field_num: u64, value: u64) {
    out.extend(encode_varint((field_num << 3) | 0));
    out.extend(encode_varint(value));
}

fn push_bytes_field(out: &mut Vec<u8>, field_num: u64, value: &[u8]) {
    out.extend(encode_varint((field_num << 3) | 2));
    out.extend(encode_varint(value.len() as u64));
    out.extend_from_slice(value);
}

/// Verify a parsed record's end-to-end signature against its wrapped
/// public key. Returns `false` on any malformed field, never panics.
pub fn verify_record(record: &PointerRecord) -> bool {
    let Some(bundle) = &record.verification else { return false };
    let Some(raw_key) = decode_libp2p_public_key(&bundle.pub_key) else { return false };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&raw_key) else { return false };
    let Ok(sig_bytes): Result<[u8; SIGNATURE_LENGTH], _> = bundle.signature.clone().try_into() else { return false };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    let mut to_verify = Vec::with_capacity(SIGNING_DOMAIN.len() + bundle.data.len());
    to_verify.extend_from_slice(SIGNING_DOMAIN);
    to_verify.extend_from_slice(&bundle.data);

    verifying_key.verify(&to_verify, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_id_has_k_prefix_and_is_base36() {
        let keypair = PointerKeypair::generate();
        let id = keypair.pointer_id();
        assert!(validate_pointer_id(&id), "pointer id {id} failed validation");
    }

    #[test]
    fn libp2p_wrap_round_trip() {
        let raw = [9u8; 32];
        let wrapped = encode_libp2p_public_key(&raw);
        assert_eq!(&wrapped[..4], &[0x08, 0x01, 0x12, 0x20]);
        assert_eq!(decode_libp2p_public_key(&wrapped), Some(raw));
    }

    #[test]
    fn decode_rejects_wrong_prefix() {
        let mut bogus = vec![0x00, 0x00, 0x00, 0x00];
        bogus.extend_from_slice(&[0u8; 32]);
        assert_eq!(decode_libp2p_public_key(&bogus), None);
    }

    #[test]
    fn marshal_parse_round_trip() {
        let keypair = PointerKeypair::generate();
        let bytes = sign_and_marshal_record(&keypair, b"/content/bafytest", 7, b"2030-01-01T00:00:00Z", 0).unwrap();
        let parsed = parse_record(&bytes).unwrap();
        assert_eq!(parsed.value, b"/content/bafytest");
        assert_eq!(parsed.sequence, 7);
        assert!(parsed.verification.is_some());
        assert!(verify_record(&parsed));
    }

    #[test]
    fn parse_without_verification_fields_yields_no_bundle() {
        let record = PointerRecord {
            value: b"/content/x".to_vec(),
            sequence: 0,
            validity: b"2030-01-01T00:00:00Z".to_vec(),
            validity_type: 0,
            verification: None,
        };
        let bytes = marshal_record(&record);
        let parsed = parse_record(&bytes).unwrap();
        assert!(parsed.verification.is_none());
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let encoded = encode_varint(value);
            let (decoded, len) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(len, encoded.len());
        }
    }
}
