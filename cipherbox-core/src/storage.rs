//! Storage backend trait and an in-memory test double.
//!
//! Generalizes the teacher's synchronous `StorageBackend` trait
//! (`citadel-keystore/src/storage.rs`) to `async_trait`, since every
//! method here suspends on real database I/O in production (§5).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::types::{
    EpochRotationLog, FolderPointer, RecordType, RepublishSchedule, ScheduleStatus, TeeEpochState, User, UserId, Vault,
};
use crate::types::PointerId;

/// Outcome of the combined publish upsert (`Publish` step 3 in spec §4.4),
/// which must land in the same transaction as schedule enrollment.
#[derive(Clone, Debug)]
pub struct PublishUpsertOutcome {
    pub sequence_number: u64,
    pub enrolled: bool,
}

/// Tally of schedule rows by state, for the §4.8 admin health endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScheduleHealthCounts {
    pub pending_jobs: u64,
    pub failed_jobs: u64,
    pub stale_jobs: u64,
}

/// Persistence for every entity in §3 plus the per-user quota counter.
///
/// Implement this for your infrastructure: `InMemoryBackend` below for
/// tests, a `sqlx`-backed Postgres implementation for production.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, CoreError>;
    async fn put_user(&self, user: &User) -> Result<(), CoreError>;

    async fn get_vault(&self, user_id: &UserId) -> Result<Option<Vault>, CoreError>;

    /// Create a vault row. Must fail if one already exists for this user —
    /// vault initialization happens exactly once per user.
    async fn init_vault(&self, vault: &Vault) -> Result<(), CoreError>;

    async fn get_folder_pointer(&self, user_id: &UserId, pointer_id: &PointerId) -> Result<Option<FolderPointer>, CoreError>;

    /// Look up which user (if any) already owns `pointer_id`, regardless
    /// of the caller's own identity. The API boundary uses this to
    /// authorize publish (§4.4: "the pointer must belong to this user or
    /// be new") since `pointer_id` is globally unique (it is the hash of
    /// the pointer's own signing public key) even though `FolderPointer`
    /// rows are keyed `(user_id, pointer_id)`.
    async fn pointer_owner(&self, pointer_id: &PointerId) -> Result<Option<UserId>, CoreError>;

    /// The combined "upsert folder_pointer, conditionally enroll in
    /// republishing" step from §4.4 step 3 / §4.5 Enrollment. Implementations
    /// must perform both writes atomically so an enrolled schedule never
    /// references a stale `latest_content_id`.
    async fn upsert_pointer_for_publish(
        &self,
        user_id: &UserId,
        pointer_id: &PointerId,
        referenced_content_id: &str,
        wrapped_signing_key: Option<&str>,
        key_epoch: Option<u32>,
        is_root: bool,
        record_type: RecordType,
        now: DateTime<Utc>,
    ) -> Result<PublishUpsertOutcome, CoreError>;

    async fn get_schedule(&self, pointer_id: &PointerId) -> Result<Option<RepublishSchedule>, CoreError>;
    async fn put_schedule(&self, schedule: &RepublishSchedule) -> Result<(), CoreError>;
    async fn list_due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RepublishSchedule>, CoreError>;

    /// Counts behind the §4.8 admin health endpoint: rows due now, rows
    /// that have failed at least once, and rows gone `stale`.
    async fn schedule_health_counts(&self, now: DateTime<Utc>) -> Result<ScheduleHealthCounts, CoreError>;

    async fn get_epoch_state(&self) -> Result<Option<TeeEpochState>, CoreError>;
    async fn put_epoch_state(&self, state: &TeeEpochState) -> Result<(), CoreError>;
    async fn append_rotation_log(&self, entry: EpochRotationLog) -> Result<(), CoreError>;

    /// Add `delta_bytes` to the user's running pinned-ciphertext byte
    /// count and return the new total.
    async fn add_quota_usage(&self, user_id: &UserId, delta_bytes: i64) -> Result<u64, CoreError>;
    async fn get_quota_usage(&self, user_id: &UserId) -> Result<u64, CoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryState {
    users: HashMap<String, User>,
    vaults: HashMap<String, Vault>,
    pointers: HashMap<(String, String), FolderPointer>,
    schedules: HashMap<String, RepublishSchedule>,
    epoch_state: Option<TeeEpochState>,
    rotation_log: Vec<EpochRotationLog>,
    quota: HashMap<String, u64>,
    next_rotation_log_id: u64,
}

/// In-memory storage for tests and local development.
pub struct InMemoryBackend {
    state: RwLock<InMemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self { state: RwLock::new(InMemoryState::default()) }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, CoreError> {
        Ok(self.state.read().await.users.get(user_id.as_str()).cloned())
    }

    async fn put_user(&self, user: &User) -> Result<(), CoreError> {
        self.state.write().await.users.insert(user.user_id.as_str().to_string(), user.clone());
        Ok(())
    }

    async fn get_vault(&self, user_id: &UserId) -> Result<Option<Vault>, CoreError> {
        Ok(self.state.read().await.vaults.get(user_id.as_str()).cloned())
    }

    async fn init_vault(&self, vault: &Vault) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        let key = vault.user_id.as_str().to_string();
        if state.vaults.contains_key(&key) {
            return Err(CoreError::InvalidInput("vault already initialized".into()));
        }
        state.vaults.insert(key, vault.clone());
        Ok(())
    }

    async fn get_folder_pointer(&self, user_id: &UserId, pointer_id: &PointerId) -> Result<Option<FolderPointer>, CoreError> {
        let key = (user_id.as_str().to_string(), pointer_id.as_str().to_string());
        Ok(self.state.read().await.pointers.get(&key).cloned())
    }

    async fn pointer_owner(&self, pointer_id: &PointerId) -> Result<Option<UserId>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .pointers
            .values()
            .find(|p| p.pointer_id.as_str() == pointer_id.as_str())
            .map(|p| p.user_id.clone()))
    }

    async fn upsert_pointer_for_publish(
        &self,
        user_id: &UserId,
        pointer_id: &PointerId,
        referenced_content_id: &str,
        wrapped_signing_key: Option<&str>,
        key_epoch: Option<u32>,
        is_root: bool,
        record_type: RecordType,
        now: DateTime<Utc>,
    ) -> Result<PublishUpsertOutcome, CoreError> {
        let mut state = self.state.write().await;
        let key = (user_id.as_str().to_string(), pointer_id.as_str().to_string());

        let sequence_number = match state.pointers.get_mut(&key) {
            Some(existing) => {
                existing.latest_content_id = referenced_content_id.to_string();
                existing.sequence_number += 1;
                existing.updated_at = now;
                if let (Some(wsk), Some(epoch)) = (wrapped_signing_key, key_epoch) {
                    existing.wrapped_signing_key = Some(wsk.to_string());
                    existing.key_epoch = Some(epoch);
                }
                existing.sequence_number
            }
            None => {
                let pointer = FolderPointer {
                    user_id: user_id.clone(),
                    pointer_id: pointer_id.clone(),
                    latest_content_id: referenced_content_id.to_string(),
                    sequence_number: 0,
                    wrapped_signing_key: wrapped_signing_key.map(|s| s.to_string()),
                    key_epoch,
                    is_root,
                    record_type,
                    updated_at: now,
                };
                state.pointers.insert(key.clone(), pointer);
                0
            }
        };

        let mut enrolled = false;
        if let (Some(wsk), Some(epoch)) = (wrapped_signing_key, key_epoch) {
            let schedule = RepublishSchedule {
                pointer_id: pointer_id.clone(),
                user_id: user_id.clone(),
                status: ScheduleStatus::Active,
                wrapped_signing_key: wsk.to_string(),
                key_epoch: epoch,
                last_content_id: referenced_content_id.to_string(),
                last_sequence_number: sequence_number,
                next_run_at: now + chrono::Duration::hours(6),
                last_run_at: None,
                consecutive_failures: 0,
            };
            state.schedules.insert(pointer_id.as_str().to_string(), schedule);
            enrolled = true;
        }

        Ok(PublishUpsertOutcome { sequence_number, enrolled })
    }

    async fn get_schedule(&self, pointer_id: &PointerId) -> Result<Option<RepublishSchedule>, CoreError> {
        Ok(self.state.read().await.schedules.get(pointer_id.as_str()).cloned())
    }

    async fn put_schedule(&self, schedule: &RepublishSchedule) -> Result<(), CoreError> {
        self.state.write().await.schedules.insert(schedule.pointer_id.as_str().to_string(), schedule.clone());
        Ok(())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RepublishSchedule>, CoreError> {
        let state = self.state.read().await;
        let mut due: Vec<RepublishSchedule> = state
            .schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Active && s.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn schedule_health_counts(&self, now: DateTime<Utc>) -> Result<ScheduleHealthCounts, CoreError> {
        let state = self.state.read().await;
        let mut counts = ScheduleHealthCounts::default();
        for schedule in state.schedules.values() {
            if schedule.status == ScheduleStatus::Active && schedule.next_run_at <= now {
                counts.pending_jobs += 1;
            }
            if schedule.consecutive_failures > 0 {
                counts.failed_jobs += 1;
            }
            if schedule.status == ScheduleStatus::Stale {
                counts.stale_jobs += 1;
            }
        }
        Ok(counts)
    }

    async fn get_epoch_state(&self) -> Result<Option<TeeEpochState>, CoreError> {
        Ok(self.state.read().await.epoch_state.clone())
    }

    async fn put_epoch_state(&self, new_state: &TeeEpochState) -> Result<(), CoreError> {
        self.state.write().await.epoch_state = Some(new_state.clone());
        Ok(())
    }

    async fn append_rotation_log(&self, mut entry: EpochRotationLog) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        entry.id = state.next_rotation_log_id;
        state.next_rotation_log_id += 1;
        state.rotation_log.push(entry);
        Ok(())
    }

    async fn add_quota_usage(&self, user_id: &UserId, delta_bytes: i64) -> Result<u64, CoreError> {
        let mut state = self.state.write().await;
        let entry = state.quota.entry(user_id.as_str().to_string()).or_insert(0);
        *entry = (*entry as i64 + delta_bytes).max(0) as u64;
        Ok(*entry)
    }

    async fn get_quota_usage(&self, user_id: &UserId) -> Result<u64, CoreError> {
        Ok(self.state.read().await.quota.get(user_id.as_str()).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vault_init_refuses_reinitialization() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let user_id = UserId::new("user-1");
        let vault = Vault {
            user_id: user_id.clone(),
            wrapped_root_key: vec![1, 2, 3],
            root_pointer_id: PointerId::new("k".to_string() + &"0".repeat(55)),
            created_at: now,
            updated_at: now,
        };
        backend.init_vault(&vault).await.unwrap();
        let err = backend.init_vault(&vault).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn publish_upsert_bumps_sequence_and_enrolls() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let user_id = UserId::new("user-1");
        let pointer_id = PointerId::new("ptr-1");

        let first = backend
            .upsert_pointer_for_publish(&user_id, &pointer_id, "bafyA", Some("aa".repeat(100).as_str()), Some(1), true, RecordType::Root, now)
            .await
            .unwrap();
        assert_eq!(first.sequence_number, 0);
        assert!(first.enrolled);

        let second = backend
            .upsert_pointer_for_publish(&user_id, &pointer_id, "bafyB", None, None, true, RecordType::Root, now)
            .await
            .unwrap();
        assert_eq!(second.sequence_number, 1);

        let schedule = backend.get_schedule(&pointer_id).await.unwrap().unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Active);
    }

    #[tokio::test]
    async fn pointer_owner_tracks_the_publishing_user() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let user_id = UserId::new("user-1");
        let pointer_id = PointerId::new("k".to_string() + &"c".repeat(55));

        assert!(backend.pointer_owner(&pointer_id).await.unwrap().is_none());

        backend
            .upsert_pointer_for_publish(&user_id, &pointer_id, "bafyA", None, None, true, RecordType::Root, now)
            .await
            .unwrap();

        assert_eq!(backend.pointer_owner(&pointer_id).await.unwrap(), Some(user_id));
    }

    #[tokio::test]
    async fn schedule_health_counts_reflect_pending_failed_and_stale() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let user_id = UserId::new("user-1");

        let due = PointerId::new("k".to_string() + &"a".repeat(55));
        backend
            .upsert_pointer_for_publish(&user_id, &due, "bafyA", Some(&"aa".repeat(100)), Some(1), true, RecordType::Root, now - chrono::Duration::hours(7))
            .await
            .unwrap();

        let mut stale = backend.get_schedule(&due).await.unwrap().unwrap();
        stale.pointer_id = PointerId::new("k".to_string() + &"b".repeat(55));
        stale.status = ScheduleStatus::Stale;
        stale.consecutive_failures = 10;
        backend.put_schedule(&stale).await.unwrap();

        let counts = backend.schedule_health_counts(now).await.unwrap();
        assert_eq!(counts.pending_jobs, 1);
        assert_eq!(counts.stale_jobs, 1);
        assert_eq!(counts.failed_jobs, 1);
    }
}
