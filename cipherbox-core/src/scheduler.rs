//! Republish scheduler (§4.5): keeps mutable pointers alive past the
//! content network's record lifetime.
//!
//! Grounded on the teacher's cron-driven rebuild of the rotation sweep
//! (`citadel-keystore/src/keystore.rs`'s `expire_due_keys` batch-then-act
//! shape), generalized from an in-process sweep to one that calls out to
//! the TEE signer over HTTP per batch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::epoch::EpochService;
use crate::error::{CoreError, ScheduleError};
use crate::relay::{PointerNetworkClient, RelayService};
use crate::storage::StorageBackend;
use crate::types::{PointerId, RecordType, RepublishSchedule, ScheduleStatus};

/// Rows selected per cron tick are partitioned into batches of this size
/// before being posted to the signer, bounding upstream request size.
pub const BATCH_SIZE: usize = 50;
/// A schedule that has failed this many consecutive times goes `stale`
/// and stops being selected until an operator reactivates it.
pub const STALE_AFTER_FAILURES: u32 = 10;
const MAX_BACKOFF: ChronoDuration = ChronoDuration::hours(1);

/// One entry of a `POST /republish` request body (§4.6).
#[derive(Debug, Clone, Serialize)]
pub struct RepublishEntry {
    pub pointer_id: String,
    pub wrapped_signing_key: String,
    pub key_epoch: u32,
    pub latest_content_id: String,
    pub sequence_number: u64,
}

/// One entry of a `POST /republish` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct RepublishResult {
    pub pointer_id: String,
    pub success: bool,
    pub signed_record: Option<String>,
    pub new_sequence_number: Option<u64>,
    pub rewrapped_signing_key: Option<String>,
    pub rewrapped_to_epoch: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepublishResponse {
    pub results: Vec<RepublishResult>,
}

/// The TEE signer's `/republish` endpoint, abstracted for testability.
#[async_trait]
pub trait TeeSignerClient: Send + Sync {
    async fn republish_batch(&self, entries: &[RepublishEntry]) -> Result<RepublishResponse, CoreError>;

    /// Fetch the raw uncompressed secp256k1 public key for `epoch`
    /// (§4.6 `GET /public-key`). Used at first boot (§4.7 Initialize)
    /// and by an operator-triggered rotation.
    async fn public_key(&self, epoch: u32) -> Result<Vec<u8>, CoreError>;

    /// Probe the signer's `/health` endpoint for the admin health
    /// endpoint (§4.8). Defaults to `true` so stub clients used in
    /// scheduler tests don't need to implement a probe they never
    /// exercise.
    async fn health(&self) -> bool {
        true
    }
}

/// `reqwest`-backed [`TeeSignerClient`], authenticating with a bearer
/// secret and a 30 s timeout (§5).
pub struct HttpTeeSignerClient {
    client: reqwest::Client,
    base_url: String,
    bearer_secret: String,
}

impl HttpTeeSignerClient {
    pub fn new(base_url: impl Into<String>, bearer_secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client config is valid");
        Self { client, base_url: base_url.into(), bearer_secret: bearer_secret.into() }
    }
}

#[async_trait]
impl TeeSignerClient for HttpTeeSignerClient {
    async fn republish_batch(&self, entries: &[RepublishEntry]) -> Result<RepublishResponse, CoreError> {
        let url = format!("{}/republish", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.bearer_secret)
            .json(&serde_json::json!({ "entries": entries }))
            .send()
            .await
            .map_err(|e| CoreError::SignerUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::SignerUnavailable(format!("status {}", response.status())));
        }
        response
            .json::<RepublishResponse>()
            .await
            .map_err(|e| CoreError::SignerUnavailable(format!("malformed response: {e}")))
    }

    async fn public_key(&self, epoch: u32) -> Result<Vec<u8>, CoreError> {
        let url = format!("{}/public-key?epoch={}", self.base_url, epoch);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_secret)
            .send()
            .await
            .map_err(|e| CoreError::SignerUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::SignerUnavailable(format!("status {}", response.status())));
        }
        #[derive(serde::Deserialize)]
        struct PublicKeyResponse {
            public_key: String,
        }
        let body: PublicKeyResponse = response
            .json()
            .await
            .map_err(|e| CoreError::SignerUnavailable(format!("malformed response: {e}")))?;
        hex::decode(&body.public_key).map_err(|e| CoreError::SignerUnavailable(format!("malformed public key: {e}")))
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(response) if response.status().is_success())
    }
}

/// Runs one cron tick of the republish sweep.
pub struct Scheduler {
    storage: Arc<dyn StorageBackend>,
    signer: Arc<dyn TeeSignerClient>,
    relay: Arc<RelayService>,
    epoch: Arc<EpochService>,
    last_tick_at: tokio::sync::RwLock<Option<DateTime<Utc>>>,
}

/// Tally of what happened during one tick, useful for the admin health
/// endpoint (§4.8) and for tests.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub went_stale: usize,
}

impl Scheduler {
    pub fn new(storage: Arc<dyn StorageBackend>, signer: Arc<dyn TeeSignerClient>, relay: Arc<RelayService>, epoch: Arc<EpochService>) -> Self {
        Self { storage, signer, relay, epoch, last_tick_at: tokio::sync::RwLock::new(None) }
    }

    /// Run one full tick: select due rows, batch, and process every
    /// batch to completion.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickReport, ScheduleError> {
        *self.last_tick_at.write().await = Some(now);
        let mut report = TickReport::default();
        loop {
            let due = self.storage.list_due_schedules(now, BATCH_SIZE).await?;
            if due.is_empty() {
                break;
            }
            report.processed += due.len();
            self.process_batch(due, now, &mut report).await?;
        }
        Ok(report)
    }

    /// When the most recent tick ran, for the admin health endpoint.
    pub async fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        *self.last_tick_at.read().await
    }

    pub async fn signer_reachable(&self) -> bool {
        self.signer.health().await
    }

    async fn process_batch(&self, batch: Vec<RepublishSchedule>, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), ScheduleError> {
        // §4.6 step 1's decrypt-with-fallback only does anything useful if
        // the epoch we send is the *live* one, not the epoch the key
        // happens to already be wrapped under (`s.key_epoch`): otherwise
        // an unmigrated entry's direct decrypt always succeeds and the
        // fallback (and its rewrap, step 5) never fires. Fall back to the
        // schedule's own stored epoch only if no `TeeEpochState` exists yet
        // (e.g. at first boot, before the signer has been queried).
        let live_epoch = self.epoch.current_state().await.ok().map(|s| s.current_epoch);

        let entries: Vec<RepublishEntry> = batch
            .iter()
            .map(|s| RepublishEntry {
                pointer_id: s.pointer_id.as_str().to_string(),
                wrapped_signing_key: s.wrapped_signing_key.clone(),
                key_epoch: live_epoch.unwrap_or(s.key_epoch),
                latest_content_id: s.last_content_id.clone(),
                sequence_number: s.last_sequence_number,
            })
            .collect();

        let response = match self.signer.republish_batch(&entries).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "republish batch failed entirely, backing off every entry");
                for schedule in &batch {
                    self.record_failure(schedule, now, report).await?;
                }
                return Ok(());
            }
        };

        for schedule in &batch {
            let result = response.results.iter().find(|r| r.pointer_id == schedule.pointer_id.as_str());
            match result {
                Some(result) if result.success => {
                    if let Err(err) = self.apply_success(schedule, result, now).await {
                        tracing::warn!(pointer_id = %schedule.pointer_id, error = %err, "republish relay failed");
                        self.record_failure(schedule, now, report).await?;
                    } else {
                        report.succeeded += 1;
                    }
                }
                _ => {
                    self.record_failure(schedule, now, report).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_success(&self, schedule: &RepublishSchedule, result: &RepublishResult, now: DateTime<Utc>) -> Result<(), CoreError> {
        let signed_record = result
            .signed_record
            .as_deref()
            .ok_or_else(|| CoreError::InvalidRecord("signer returned success with no signed_record".into()))?;
        let new_sequence = result
            .new_sequence_number
            .ok_or_else(|| CoreError::InvalidRecord("signer returned success with no new_sequence_number".into()))?;

        let (wrapped_signing_key, key_epoch) = match (&result.rewrapped_signing_key, result.rewrapped_to_epoch) {
            (Some(key), Some(epoch)) => (Some(key.as_str()), Some(epoch)),
            _ => (None, None),
        };

        self.relay
            .publish(
                &schedule.user_id,
                &schedule.pointer_id,
                signed_record,
                &schedule.last_content_id,
                wrapped_signing_key,
                key_epoch,
                false,
                RecordType::Folder,
            )
            .await
            .map_err(|e| e.0)?;

        let mut updated = schedule.clone();
        updated.last_sequence_number = new_sequence;
        updated.last_run_at = Some(now);
        updated.next_run_at = now + ChronoDuration::hours(6);
        updated.consecutive_failures = 0;
        if let (Some(key), Some(epoch)) = (wrapped_signing_key, key_epoch) {
            updated.wrapped_signing_key = key.to_string();
            updated.key_epoch = epoch;
        }
        self.storage.put_schedule(&updated).await
    }

    async fn record_failure(&self, schedule: &RepublishSchedule, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), ScheduleError> {
        let mut updated = schedule.clone();
        updated.consecutive_failures += 1;
        updated.last_run_at = Some(now);

        let backoff_secs = 30f64 * 2f64.powi(updated.consecutive_failures as i32);
        let backoff = ChronoDuration::seconds(backoff_secs as i64).min(MAX_BACKOFF);
        updated.next_run_at = now + backoff;

        if updated.consecutive_failures >= STALE_AFTER_FAILURES {
            updated.status = ScheduleStatus::Stale;
            report.went_stale += 1;
        }
        report.failed += 1;
        self.storage.put_schedule(&updated).await?;
        Ok(())
    }

    /// Out-of-band reactivation: flip a `stale` schedule back to `active`
    /// and clear its backoff so it is picked up on the next tick.
    pub async fn reactivate(&self, pointer_id: &PointerId, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let mut schedule = self.storage.get_schedule(pointer_id).await?.ok_or(CoreError::NotFound)?;
        schedule.status = ScheduleStatus::Active;
        schedule.consecutive_failures = 0;
        schedule.next_run_at = now;
        self.storage.put_schedule(&schedule).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;
    use crate::types::UserId;

    struct StubSigner {
        response: RepublishResponse,
    }

    #[async_trait]
    impl TeeSignerClient for StubSigner {
        async fn republish_batch(&self, _entries: &[RepublishEntry]) -> Result<RepublishResponse, CoreError> {
            Ok(self.response.clone())
        }

        async fn public_key(&self, _epoch: u32) -> Result<Vec<u8>, CoreError> {
            Ok(vec![4; 65])
        }
    }

    struct NetworkStub;

    #[async_trait]
    impl PointerNetworkClient for NetworkStub {
        async fn put_record(&self, _pointer_id: &str, _record_bytes: &[u8]) -> Result<(), crate::relay::RelayOutcome> {
            Ok(())
        }
        async fn get_record(&self, _pointer_id: &str) -> Result<Vec<u8>, crate::relay::RelayOutcome> {
            Err(crate::relay::RelayOutcome::NotFound)
        }
    }

    async fn seed_schedule(storage: &InMemoryBackend, user_id: &UserId, pointer_id: &PointerId, now: DateTime<Utc>) {
        storage
            .upsert_pointer_for_publish(user_id, pointer_id, "bafyOld", Some(&"aa".repeat(100)), Some(1), true, RecordType::Root, now - ChronoDuration::hours(7))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_republish_advances_schedule() {
        let storage = Arc::new(InMemoryBackend::new());
        let now = Utc::now();
        let user_id = UserId::new("user-1");
        let pointer_id = PointerId::new("k".to_string() + &"a".repeat(55));
        seed_schedule(&storage, &user_id, &pointer_id, now).await;

        let signer = Arc::new(StubSigner {
            response: RepublishResponse {
                results: vec![RepublishResult {
                    pointer_id: pointer_id.as_str().to_string(),
                    success: true,
                    signed_record: Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"fake-record")),
                    new_sequence_number: Some(5),
                    rewrapped_signing_key: None,
                    rewrapped_to_epoch: None,
                    error: None,
                }],
            },
        });
        let relay = Arc::new(RelayService::new(storage.clone(), Arc::new(NetworkStub)));
        let epoch = Arc::new(EpochService::new(storage.clone()));
        let scheduler = Scheduler::new(storage.clone(), signer, relay, epoch);

        let report = scheduler.run_tick(now).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);

        let schedule = storage.get_schedule(&pointer_id).await.unwrap().unwrap();
        assert_eq!(schedule.last_sequence_number, 5);
        assert_eq!(schedule.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn repeated_failures_go_stale() {
        let storage = Arc::new(InMemoryBackend::new());
        let now = Utc::now();
        let user_id = UserId::new("user-1");
        let pointer_id = PointerId::new("k".to_string() + &"a".repeat(55));
        seed_schedule(&storage, &user_id, &pointer_id, now).await;

        let mut schedule = storage.get_schedule(&pointer_id).await.unwrap().unwrap();
        schedule.consecutive_failures = STALE_AFTER_FAILURES - 1;
        schedule.next_run_at = now - ChronoDuration::seconds(1);
        storage.put_schedule(&schedule).await.unwrap();

        let signer = Arc::new(StubSigner {
            response: RepublishResponse {
                results: vec![RepublishResult {
                    pointer_id: pointer_id.as_str().to_string(),
                    success: false,
                    signed_record: None,
                    new_sequence_number: None,
                    rewrapped_signing_key: None,
                    rewrapped_to_epoch: None,
                    error: Some("decrypt failed".into()),
                }],
            },
        });
        let relay = Arc::new(RelayService::new(storage.clone(), Arc::new(NetworkStub)));
        let epoch = Arc::new(EpochService::new(storage.clone()));
        let scheduler = Scheduler::new(storage.clone(), signer, relay, epoch);

        let report = scheduler.run_tick(now).await.unwrap();
        assert_eq!(report.went_stale, 1);

        let schedule = storage.get_schedule(&pointer_id).await.unwrap().unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Stale);
    }

    #[tokio::test]
    async fn run_tick_records_its_own_timestamp() {
        let storage = Arc::new(InMemoryBackend::new());
        let signer = Arc::new(StubSigner { response: RepublishResponse { results: vec![] } });
        let relay = Arc::new(RelayService::new(storage.clone(), Arc::new(NetworkStub)));
        let epoch = Arc::new(EpochService::new(storage.clone()));
        let scheduler = Scheduler::new(storage, signer, relay, epoch);

        assert!(scheduler.last_tick_at().await.is_none());
        let now = Utc::now();
        scheduler.run_tick(now).await.unwrap();
        assert_eq!(scheduler.last_tick_at().await, Some(now));
    }
}
