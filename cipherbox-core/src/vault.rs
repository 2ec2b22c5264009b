//! Vault lifecycle and encrypted folder-metadata helpers (§4.1, §4.2).
//!
//! Grounded on `examples/FSM1-cipher-box/.../crypto/folder.rs` for the
//! encrypt/decrypt-a-JSON-blob pipeline (serialize, seal, zeroize the
//! intermediate plaintext), and on `citadel-keystore/src/keystore.rs`'s
//! enforcement-gate style (`check_expiration`/`destroy` fetch-then-guard)
//! for the quota check ahead of a write.

use std::sync::Arc;

use chrono::Utc;
use zeroize::Zeroize;

use cipherbox_crypto::aead;

use crate::error::{CoreError, VaultError};
use crate::storage::StorageBackend;
use crate::types::{FolderMetadata, UserId, Vault};

/// Per-user pinned-ciphertext quota (bytes). Mirrors the teacher's
/// policy-driven limits, but this one value is fixed rather than
/// per-policy since CipherBox has a single plan.
pub const DEFAULT_QUOTA_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Vault lifecycle and folder-metadata sealing, backed by a
/// [`StorageBackend`].
pub struct VaultService {
    storage: Arc<dyn StorageBackend>,
    quota_bytes: u64,
}

impl VaultService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage, quota_bytes: DEFAULT_QUOTA_BYTES }
    }

    pub fn with_quota(storage: Arc<dyn StorageBackend>, quota_bytes: u64) -> Self {
        Self { storage, quota_bytes }
    }

    /// Initialize a user's vault: persists their wrapping public key and
    /// the wrapped root key, anchored at `root_pointer_id`. Fails if the
    /// vault already exists — initialization happens exactly once (§4.1).
    pub async fn init_vault(&self, vault: &Vault) -> Result<(), VaultError> {
        self.storage.init_vault(vault).await.map_err(VaultError)
    }

    pub async fn get_vault(&self, user_id: &UserId) -> Result<Vault, VaultError> {
        self.storage
            .get_vault(user_id)
            .await
            .map_err(VaultError)?
            .ok_or(CoreError::NotFound)
            .map_err(VaultError)
    }

    /// Reject a write if it would push the user's pinned-ciphertext total
    /// over their quota. Call before pinning new ciphertext, not after.
    pub async fn check_quota(&self, user_id: &UserId, additional_bytes: u64) -> Result<(), CoreError> {
        let used = self.storage.get_quota_usage(user_id).await?;
        if used.saturating_add(additional_bytes) > self.quota_bytes {
            return Err(CoreError::QuotaExceeded);
        }
        Ok(())
    }

    /// Record that `delta_bytes` of pinned ciphertext were added (or, if
    /// negative in spirit, removed — callers pass a signed delta via
    /// `add_quota_usage`'s i64 argument at the storage layer, exposed
    /// here only for the growth path new uploads take).
    pub async fn record_usage(&self, user_id: &UserId, additional_bytes: u64) -> Result<u64, CoreError> {
        self.storage.add_quota_usage(user_id, additional_bytes as i64).await
    }
}

/// Seal a [`FolderMetadata`] value to its AEAD-encrypted wire form under
/// a folder's 32-byte symmetric key. The JSON intermediate is zeroized
/// before this returns.
pub fn encrypt_folder_metadata(
    folder_key: &[u8; 32],
    metadata: &FolderMetadata,
    aad: &[u8],
) -> Result<aead::Sealed, CoreError> {
    let mut json = serde_json::to_vec(metadata)
        .map_err(|e| CoreError::Fatal(format!("folder metadata serialization: {e}")))?;
    let sealed = aead::seal(folder_key, &json, aad).map_err(CoreError::from);
    json.zeroize();
    sealed
}

/// Open a sealed folder-metadata blob and parse it back into
/// [`FolderMetadata`].
pub fn decrypt_folder_metadata(
    folder_key: &[u8; 32],
    iv: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<FolderMetadata, CoreError> {
    let plaintext = aead::open(folder_key, iv, ciphertext, aad)?;
    serde_json::from_slice(&plaintext).map_err(|e| CoreError::InvalidRecord(format!("folder metadata: {e}")))
}

/// Construct the empty folder metadata a brand-new folder (or the root
/// vault itself) starts from.
pub fn empty_folder_metadata() -> FolderMetadata {
    FolderMetadata::empty(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;
    use crate::types::PointerId;

    fn test_vault(user_id: UserId) -> Vault {
        let now = Utc::now();
        Vault {
            user_id,
            wrapped_root_key: vec![9; 97],
            root_pointer_id: PointerId::new("k".to_string() + &"a".repeat(55)),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn init_vault_then_get_round_trips() {
        let storage = Arc::new(InMemoryBackend::new());
        let service = VaultService::new(storage);
        let user_id = UserId::new("user-1");
        service.init_vault(&test_vault(user_id.clone())).await.unwrap();
        let fetched = service.get_vault(&user_id).await.unwrap();
        assert_eq!(fetched.user_id, user_id);
    }

    #[tokio::test]
    async fn get_vault_missing_is_not_found() {
        let storage = Arc::new(InMemoryBackend::new());
        let service = VaultService::new(storage);
        let err = service.get_vault(&UserId::new("nobody")).await.unwrap_err();
        assert!(matches!(err.0, CoreError::NotFound));
    }

    #[tokio::test]
    async fn quota_rejects_once_exceeded() {
        let storage = Arc::new(InMemoryBackend::new());
        let service = VaultService::with_quota(storage, 100);
        let user_id = UserId::new("user-1");
        service.check_quota(&user_id, 50).await.unwrap();
        service.record_usage(&user_id, 80).await.unwrap();
        let err = service.check_quota(&user_id, 50).await.unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded));
    }

    #[test]
    fn folder_metadata_round_trips_through_seal() {
        let key = [3u8; 32];
        let metadata = empty_folder_metadata();
        let sealed = encrypt_folder_metadata(&key, &metadata, b"folder-aad").unwrap();
        let opened = decrypt_folder_metadata(&key, &sealed.iv, &sealed.ciphertext, b"folder-aad").unwrap();
        assert!(opened.children.is_empty());
    }

    #[test]
    fn folder_metadata_wrong_key_fails() {
        let metadata = empty_folder_metadata();
        let sealed = encrypt_folder_metadata(&[3u8; 32], &metadata, b"aad").unwrap();
        let err = decrypt_folder_metadata(&[9u8; 32], &sealed.iv, &sealed.ciphertext, b"aad").unwrap_err();
        assert!(matches!(err, CoreError::AuthFailure));
    }
}
