//! DTO-level validation for the mutable-pointer relay's external inputs
//! (§6). Every check here returns [`CoreError::InvalidInput`]; nothing
//! here talks to storage or the network.

use base64::Engine;

use crate::error::CoreError;

/// Largest base64-decoded signed-record size we accept.
const MAX_RECORD_BYTES: usize = 2 * 1024 * 1024;

/// Hex-encoded `wrapped_signing_key` bound: large enough to hold an ECIES
/// envelope (ephemeral pubkey + iv + 32-byte seed + tag, hex-doubled), small
/// enough to bound DB row size.
const MIN_WRAPPED_SIGNING_KEY_HEX_LEN: usize = 200;
const MAX_WRAPPED_SIGNING_KEY_HEX_LEN: usize = 1000;

/// Validate a `pointer_id` against the bounded mutable-pointer identifier
/// form: `k` prefix, base36 alphabet, 50-62 characters.
pub fn validate_pointer_id(pointer_id: &str) -> Result<(), CoreError> {
    if cipherbox_crypto::signing::validate_pointer_id(pointer_id) {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("malformed pointer_id: {pointer_id}")))
    }
}

/// Validate a `referenced_content_id` against the CID grammar: CIDv0
/// (`Qm` + 44 base58 chars) or CIDv1 (`baf` + base36/base32 body).
pub fn validate_content_id(content_id: &str) -> Result<(), CoreError> {
    let is_cidv0 = content_id.len() == 46
        && content_id.starts_with("Qm")
        && content_id.chars().all(|c| c.is_ascii_alphanumeric());
    let is_cidv1 = content_id.len() >= 10
        && content_id.starts_with("baf")
        && content_id.chars().all(|c| c.is_ascii_alphanumeric());

    if is_cidv0 || is_cidv1 {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("malformed content_id: {content_id}")))
    }
}

/// Validate and decode a base64 `record` field: non-empty, decodes, and
/// the decoded size stays at or under the 2 MiB ceiling.
pub fn validate_and_decode_record(record_b64: &str) -> Result<Vec<u8>, CoreError> {
    if record_b64.is_empty() {
        return Err(CoreError::InvalidInput("record must not be empty".into()));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(record_b64)
        .map_err(|e| CoreError::InvalidInput(format!("record is not valid base64: {e}")))?;
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(CoreError::InvalidInput(format!(
            "record exceeds {MAX_RECORD_BYTES} bytes decoded"
        )));
    }
    Ok(bytes)
}

/// Validate a `wrapped_signing_key`: hex-encoded, within the bounded
/// length window.
pub fn validate_wrapped_signing_key(hex_str: &str) -> Result<(), CoreError> {
    if !(MIN_WRAPPED_SIGNING_KEY_HEX_LEN..=MAX_WRAPPED_SIGNING_KEY_HEX_LEN).contains(&hex_str.len()) {
        return Err(CoreError::InvalidInput(format!(
            "wrapped_signing_key must be {MIN_WRAPPED_SIGNING_KEY_HEX_LEN}-{MAX_WRAPPED_SIGNING_KEY_HEX_LEN} hex characters"
        )));
    }
    if hex::decode(hex_str).is_err() {
        return Err(CoreError::InvalidInput("wrapped_signing_key is not valid hex".into()));
    }
    Ok(())
}

/// `wrapped_signing_key` and `key_epoch` are accepted only together: one
/// present without the other is `InvalidInput` (§8 boundary behavior).
pub fn validate_tee_fields_paired(wrapped_signing_key: Option<&str>, key_epoch: Option<u32>) -> Result<(), CoreError> {
    match (wrapped_signing_key, key_epoch) {
        (Some(_), Some(_)) | (None, None) => Ok(()),
        _ => Err(CoreError::InvalidInput(
            "wrapped_signing_key and key_epoch must be provided together".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_cidv0_and_cidv1() {
        assert!(validate_content_id("Qm").is_err());
        assert!(validate_content_id(&format!("Qm{}", "a".repeat(44))).is_ok());
        assert!(validate_content_id("bafyreigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi").is_ok());
        assert!(validate_content_id("notacid").is_err());
    }

    #[test]
    fn record_must_decode_and_stay_under_limit() {
        assert!(validate_and_decode_record("").is_err());
        assert!(validate_and_decode_record("not base64!!").is_err());
        let small = base64::engine::general_purpose::STANDARD.encode(b"hello");
        assert!(validate_and_decode_record(&small).is_ok());
    }

    #[test]
    fn tee_fields_must_be_paired() {
        assert!(validate_tee_fields_paired(Some("aa"), None).is_err());
        assert!(validate_tee_fields_paired(None, Some(1)).is_err());
        assert!(validate_tee_fields_paired(None, None).is_ok());
        assert!(validate_tee_fields_paired(Some("aa"), Some(1)).is_ok());
    }

    #[test]
    fn wrapped_signing_key_length_bounds() {
        assert!(validate_wrapped_signing_key(&"aa".repeat(50)).is_err()); // 100 chars, too short
        assert!(validate_wrapped_signing_key(&"aa".repeat(150)).is_ok()); // 300 chars
        assert!(validate_wrapped_signing_key(&"aa".repeat(600)).is_err()); // 1200 chars, too long
    }
}
