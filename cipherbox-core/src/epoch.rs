//! TEE signer epoch state and rotation (§4.7).
//!
//! Grounded on the teacher's atomic write-then-audit pattern in
//! `citadel-keystore/src/keystore.rs`: every lifecycle method there does
//! its storage write immediately followed by an `audit.record(...)`
//! call, never the reverse. `rotate` below follows the same order —
//! persist the new state, then append the rotation-log row — and treats
//! both as one logical step even though the in-memory backend can't
//! offer a real transaction boundary; a `sqlx` backend would wrap both
//! writes in a single `Transaction`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

use crate::error::{CoreError, EpochError};
use crate::storage::StorageBackend;
use crate::types::{EpochRotationLog, TeeEpochState};

/// How long a rotated-out epoch's key stays usable for decrypt-with-
/// fallback before entries still referencing it go stale (§4.7).
pub const GRACE_WINDOW: ChronoDuration = ChronoDuration::weeks(4);

/// Reads and rotates [`TeeEpochState`], backed by a [`StorageBackend`].
pub struct EpochService {
    storage: Arc<dyn StorageBackend>,
    grace_window: ChronoDuration,
}

impl EpochService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage, grace_window: GRACE_WINDOW }
    }

    /// Override the default grace window (e.g. from `Config::grace_window`).
    pub fn with_grace_window(mut self, grace_window: ChronoDuration) -> Self {
        self.grace_window = grace_window;
        self
    }

    /// First-boot bootstrap: if no epoch state exists yet, seed it at
    /// epoch 1 with the signer's currently-reported public key. A no-op
    /// if state already exists, so this is safe to call on every start.
    pub async fn initialize(&self, queried_public_key: Vec<u8>) -> Result<TeeEpochState, EpochError> {
        if let Some(existing) = self.storage.get_epoch_state().await? {
            return Ok(existing);
        }
        let state = TeeEpochState {
            current_epoch: 1,
            current_public_key: queried_public_key,
            previous_epoch: None,
            previous_public_key: None,
            previous_deprecation_at: None,
        };
        self.storage.put_epoch_state(&state).await?;
        Ok(state)
    }

    pub async fn current_state(&self) -> Result<TeeEpochState, EpochError> {
        self.storage.get_epoch_state().await?.ok_or(CoreError::NotFound).map_err(EpochError)
    }

    /// Rotate to a new epoch. The outgoing current epoch becomes
    /// previous, with a 4-week deprecation deadline; the caller supplies
    /// the new epoch number and its already-fetched public key (the
    /// signer, not this service, derives epoch keypairs).
    pub async fn rotate(&self, new_epoch: u32, new_public_key: Vec<u8>, reason: &str, now: DateTime<Utc>) -> Result<TeeEpochState, EpochError> {
        let existing = self.current_state().await?;

        if new_epoch <= existing.current_epoch {
            return Err(EpochError(CoreError::InvalidInput(format!(
                "new epoch {new_epoch} must exceed current epoch {}",
                existing.current_epoch
            ))));
        }

        let rotated = TeeEpochState {
            current_epoch: new_epoch,
            current_public_key: new_public_key.clone(),
            previous_epoch: Some(existing.current_epoch),
            previous_public_key: Some(existing.current_public_key.clone()),
            previous_deprecation_at: Some(now + self.grace_window),
        };
        self.storage.put_epoch_state(&rotated).await?;

        self.storage
            .append_rotation_log(EpochRotationLog {
                id: 0,
                from_epoch: existing.current_epoch,
                to_epoch: new_epoch,
                from_public_key: existing.current_public_key,
                to_public_key: new_public_key,
                reason: reason.to_string(),
                at: now,
            })
            .await?;

        Ok(rotated)
    }

    /// `true` once `previous_deprecation_at` has passed: decrypt-with-
    /// fallback to `previous_epoch` is no longer offered, and any
    /// schedule entry still wrapped under it must be treated as stale
    /// by the caller rather than retried.
    pub async fn previous_epoch_deprecated(&self, now: DateTime<Utc>) -> Result<bool, EpochError> {
        let state = self.current_state().await?;
        Ok(match state.previous_deprecation_at {
            Some(deadline) => now >= deadline,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;

    #[tokio::test]
    async fn initialize_seeds_epoch_one() {
        let service = EpochService::new(Arc::new(InMemoryBackend::new()));
        let state = service.initialize(vec![4; 65]).await.unwrap();
        assert_eq!(state.current_epoch, 1);
        assert!(state.previous_epoch.is_none());
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let service = EpochService::new(Arc::new(InMemoryBackend::new()));
        service.initialize(vec![4; 65]).await.unwrap();
        let second = service.initialize(vec![9; 65]).await.unwrap();
        assert_eq!(second.current_public_key, vec![4; 65]);
    }

    #[tokio::test]
    async fn rotate_demotes_current_to_previous_with_grace_window() {
        let service = EpochService::new(Arc::new(InMemoryBackend::new()));
        service.initialize(vec![1; 65]).await.unwrap();
        let now = Utc::now();

        let rotated = service.rotate(2, vec![2; 65], "operator rotation", now).await.unwrap();

        assert_eq!(rotated.current_epoch, 2);
        assert_eq!(rotated.current_public_key, vec![2; 65]);
        assert_eq!(rotated.previous_epoch, Some(1));
        assert_eq!(rotated.previous_public_key, Some(vec![1; 65]));
        assert_eq!(rotated.previous_deprecation_at, Some(now + GRACE_WINDOW));
    }

    #[tokio::test]
    async fn rotate_rejects_non_increasing_epoch() {
        let service = EpochService::new(Arc::new(InMemoryBackend::new()));
        service.initialize(vec![1; 65]).await.unwrap();
        let err = service.rotate(1, vec![2; 65], "bad", Utc::now()).await.unwrap_err();
        assert!(matches!(err.0, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn previous_epoch_deprecates_after_grace_window() {
        let service = EpochService::new(Arc::new(InMemoryBackend::new()));
        service.initialize(vec![1; 65]).await.unwrap();
        let now = Utc::now();
        service.rotate(2, vec![2; 65], "rotation", now).await.unwrap();

        assert!(!service.previous_epoch_deprecated(now).await.unwrap());
        assert!(service.previous_epoch_deprecated(now + GRACE_WINDOW + ChronoDuration::seconds(1)).await.unwrap());
    }
}
