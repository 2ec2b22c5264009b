//! Mutable-pointer relay & resolver (§4.4): the contract-heaviest piece.
//!
//! Grounded on `examples/FSM1-cipher-box/.../api/ipns.rs` (status-code
//! branching around a resolve call) and `.../api/client.rs` (timeout
//! configuration, a thin wrapper over `reqwest::Client`) for the HTTP
//! shape, and on the teacher's `RateLimiter`/backoff-free retry style
//! generalized here to use the `backoff` crate since the teacher never
//! needed cross-process retries against an external network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use regex::Regex;

use cipherbox_crypto::signing::{self, PointerRecord};

use crate::error::{CoreError, PublishError, ResolveError};
use crate::storage::StorageBackend;
use crate::types::{PointerId, RecordType, UserId};
use crate::validate;

const CONTENT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: usize = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// The content-network's pointer endpoint, abstracted so the relay logic
/// is testable without a live IPFS/IPNS gateway.
#[async_trait]
pub trait PointerNetworkClient: Send + Sync {
    /// PUT the raw marshaled record bytes to the network. `Ok(())` only
    /// on a successful publish; callers have already retried internally.
    async fn put_record(&self, pointer_id: &str, record_bytes: &[u8]) -> Result<(), RelayOutcome>;

    /// GET the raw marshaled record bytes for a pointer.
    async fn get_record(&self, pointer_id: &str) -> Result<Vec<u8>, RelayOutcome>;
}

/// What happened on one network attempt, used to decide retry vs.
/// fail-fast vs. fall back to cache.
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// Transient: network error, timeout, or 5xx. Retryable.
    Transient(String),
    /// `429`, optionally carrying a `Retry-After` duration.
    RateLimited(Option<Duration>),
    /// The network said the record does not exist (`404`).
    NotFound,
    /// Any other non-success status. Not retried.
    Rejected(u16),
}

/// `reqwest`-backed [`PointerNetworkClient`] against a real content
/// network gateway.
pub struct HttpPointerNetworkClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPointerNetworkClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CONTENT_NETWORK_TIMEOUT)
            .build()
            .expect("reqwest client config is valid");
        Self { client, base_url: base_url.into() }
    }

    fn classify_status(status: reqwest::StatusCode, body_hint: Option<&str>) -> RelayOutcome {
        if status == reqwest::StatusCode::NOT_FOUND {
            RelayOutcome::NotFound
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = body_hint.and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs);
            RelayOutcome::RateLimited(retry_after)
        } else if status.is_server_error() {
            RelayOutcome::Transient(format!("status {status}"))
        } else {
            RelayOutcome::Rejected(status.as_u16())
        }
    }
}

#[async_trait]
impl PointerNetworkClient for HttpPointerNetworkClient {
    async fn put_record(&self, pointer_id: &str, record_bytes: &[u8]) -> Result<(), RelayOutcome> {
        let url = format!("{}/pointer/{}", self.base_url, pointer_id);
        let response = self
            .client
            .put(&url)
            .header("content-type", "application/vnd.ipfs.ipns-record")
            .body(record_bytes.to_vec())
            .send()
            .await
            .map_err(|e| RelayOutcome::Transient(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Err(Self::classify_status(response.status(), retry_after.as_deref()))
    }

    async fn get_record(&self, pointer_id: &str) -> Result<Vec<u8>, RelayOutcome> {
        let url = format!("{}/pointer/{}", self.base_url, pointer_id);
        let response = self
            .client
            .get(&url)
            .header("accept", "application/vnd.ipfs.ipns-record")
            .send()
            .await
            .map_err(|e| RelayOutcome::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(Self::classify_status(response.status(), retry_after.as_deref()));
        }

        response.bytes().await.map(|b| b.to_vec()).map_err(|e| RelayOutcome::Transient(e.to_string()))
    }
}

/// Drive `attempt` through the three-attempt retry/backoff policy common
/// to publish and resolve (§4.4 step 2 / step 1). `Rejected` and
/// `NotFound` never retry; `Transient`/`RateLimited` do, honoring any
/// `Retry-After` the network supplied.
async fn with_retry<T, F, Fut>(mut attempt: F) -> Result<T, RelayOutcome>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RelayOutcome>>,
{
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(INITIAL_BACKOFF)
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build();

    let mut last_err = RelayOutcome::Transient("no attempts made".into());
    for attempt_no in 0..RETRY_ATTEMPTS {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(outcome @ (RelayOutcome::Rejected(_) | RelayOutcome::NotFound)) => return Err(outcome),
            Err(outcome) => {
                last_err = outcome.clone();
                if attempt_no + 1 == RETRY_ATTEMPTS {
                    break;
                }
                let wait = match &outcome {
                    RelayOutcome::RateLimited(Some(retry_after)) => *retry_after,
                    _ => backoff.next_backoff().unwrap_or(INITIAL_BACKOFF),
                };
                tokio::time::sleep(wait).await;
            }
        }
    }
    Err(last_err)
}

fn content_id_pattern() -> Regex {
    Regex::new(r"/content/([A-Za-z0-9]+)").expect("static regex compiles")
}

/// The result of a publish: the sequence number the caller's update now
/// occupies.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub sequence_number: u64,
}

/// The result of a resolve: the content ID a pointer currently refers
/// to, plus an optional signature-verification bundle.
#[derive(Debug, Clone)]
pub struct ResolveResult {
    pub content_id: String,
    pub sequence_number: u64,
    pub signature_bundle: Option<SignatureBundle>,
}

#[derive(Debug, Clone)]
pub struct SignatureBundle {
    pub signature: Vec<u8>,
    pub data: Vec<u8>,
    pub public_key: Vec<u8>,
}

pub struct RelayService {
    storage: Arc<dyn StorageBackend>,
    network: Arc<dyn PointerNetworkClient>,
}

impl RelayService {
    pub fn new(storage: Arc<dyn StorageBackend>, network: Arc<dyn PointerNetworkClient>) -> Self {
        Self { storage, network }
    }

    /// Publish a signed pointer record (§4.4 Publish). `is_root` and
    /// `record_type` describe what this pointer anchors; the caller (the
    /// API boundary) is responsible for authorizing that `pointer_id`
    /// belongs to `user_id` or is new.
    pub async fn publish(
        &self,
        user_id: &UserId,
        pointer_id: &PointerId,
        record_b64: &str,
        referenced_content_id: &str,
        wrapped_signing_key: Option<&str>,
        key_epoch: Option<u32>,
        is_root: bool,
        record_type: RecordType,
    ) -> Result<PublishResult, PublishError> {
        validate::validate_pointer_id(pointer_id.as_str())?;
        validate::validate_content_id(referenced_content_id)?;
        let record_bytes = validate::validate_and_decode_record(record_b64)?;
        if let Some(wsk) = wrapped_signing_key {
            validate::validate_wrapped_signing_key(wsk)?;
        }
        validate::validate_tee_fields_paired(wrapped_signing_key, key_epoch)?;

        with_retry(|| self.network.put_record(pointer_id.as_str(), &record_bytes))
            .await
            .map_err(|outcome| relay_outcome_to_core_error(outcome, "publish"))?;

        let outcome = self
            .storage
            .upsert_pointer_for_publish(
                user_id,
                pointer_id,
                referenced_content_id,
                wrapped_signing_key,
                key_epoch,
                is_root,
                record_type,
                Utc::now(),
            )
            .await?;

        Ok(PublishResult { sequence_number: outcome.sequence_number })
    }

    /// Resolve a pointer (§4.4 Resolve), falling back to the cached
    /// schedule row on upstream unavailability — including a malformed
    /// record or an unmatched `/content/<id>` value, which §4.4 step 4
    /// groups with 5xx/timeouts as ordinary fallback triggers, not hard
    /// failures.
    pub async fn resolve(&self, user_id: &UserId, pointer_id: &PointerId) -> Result<ResolveResult, ResolveError> {
        validate::validate_pointer_id(pointer_id.as_str())?;

        let network_result = with_retry(|| self.network.get_record(pointer_id.as_str())).await;

        match network_result {
            Ok(bytes) => match self.parse_resolved_record(pointer_id, &bytes).await {
                Ok(result) => Ok(result),
                Err(parse_err) => self.fallback_to_cache(user_id, pointer_id, parse_err.0).await,
            },
            Err(RelayOutcome::NotFound) => Err(CoreError::NotFound.into()),
            Err(outcome) => {
                let fallback_err = relay_outcome_to_core_error(outcome, "resolve");
                self.fallback_to_cache(user_id, pointer_id, fallback_err).await
            }
        }
    }

    /// Shared cache fallback for both network-level failures and
    /// record-parse failures: the cached schedule tip, then the cached
    /// folder-pointer tip, then `fallback_err` if neither exists. Falls
    /// back regardless of the requester's identity.
    async fn fallback_to_cache(&self, user_id: &UserId, pointer_id: &PointerId, fallback_err: CoreError) -> Result<ResolveResult, ResolveError> {
        match self.storage.get_schedule(pointer_id).await? {
            Some(schedule) => Ok(ResolveResult {
                content_id: schedule.last_content_id,
                sequence_number: schedule.last_sequence_number,
                signature_bundle: None,
            }),
            None => match self.storage.get_folder_pointer(user_id, pointer_id).await? {
                Some(pointer) => Ok(ResolveResult {
                    content_id: pointer.latest_content_id,
                    sequence_number: pointer.sequence_number,
                    signature_bundle: None,
                }),
                None => Err(fallback_err.into()),
            },
        }
    }

    async fn parse_resolved_record(&self, pointer_id: &PointerId, bytes: &[u8]) -> Result<ResolveResult, ResolveError> {
        let record: PointerRecord = signing::parse_record(bytes).map_err(CoreError::from)?;
        let _ = pointer_id;

        let value_str = String::from_utf8(record.value).map_err(|_| CoreError::InvalidRecord("value is not utf-8".into()))?;
        let content_id = content_id_pattern()
            .captures(&value_str)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| CoreError::InvalidRecord("value did not match /content/<id>".into()))?;

        let signature_bundle = record.verification.map(|bundle| SignatureBundle {
            signature: bundle.signature,
            data: bundle.data,
            public_key: bundle.pub_key,
        });

        Ok(ResolveResult { content_id, sequence_number: record.sequence, signature_bundle })
    }
}

/// Classify a terminal [`RelayOutcome`] into a [`CoreError`]. For
/// `Rejected` (§4.4 step 2's "fail fast, status is logged, not returned
/// to the caller"), the status is logged here — the only place it is
/// observed — since the resulting `CoreError::UpstreamUnavailable`'s
/// `Display` never reaches the client (`core_error_response` substitutes
/// a fixed generic message for that variant).
fn relay_outcome_to_core_error(outcome: RelayOutcome, op: &str) -> CoreError {
    match outcome {
        RelayOutcome::Transient(msg) => CoreError::UpstreamUnavailable(format!("{op}: {msg}")),
        RelayOutcome::RateLimited(_) => CoreError::UpstreamUnavailable(format!("{op}: rate limited upstream")),
        RelayOutcome::NotFound => CoreError::NotFound,
        RelayOutcome::Rejected(status) => {
            tracing::warn!(status, op, "upstream rejected record");
            CoreError::UpstreamUnavailable(format!("{op}: rejected with status {status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;
    use cipherbox_crypto::signing::PointerKeypair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct StubNetwork {
        put_calls: AtomicUsize,
        put_fail_times: usize,
        stored_record: AsyncMutex<Option<Vec<u8>>>,
        get_outcome: Option<RelayOutcome>,
    }

    #[async_trait]
    impl PointerNetworkClient for StubNetwork {
        async fn put_record(&self, _pointer_id: &str, record_bytes: &[u8]) -> Result<(), RelayOutcome> {
            let n = self.put_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.put_fail_times {
                return Err(RelayOutcome::Transient("stub failure".into()));
            }
            *self.stored_record.lock().await = Some(record_bytes.to_vec());
            Ok(())
        }

        async fn get_record(&self, _pointer_id: &str) -> Result<Vec<u8>, RelayOutcome> {
            if let Some(outcome) = &self.get_outcome {
                return Err(outcome.clone());
            }
            self.stored_record.lock().await.clone().ok_or(RelayOutcome::NotFound)
        }
    }

    fn sample_record_b64(sequence: u64) -> (String, PointerKeypair) {
        let keypair = PointerKeypair::generate();
        let bytes = signing::sign_and_marshal_record(
            &keypair,
            b"/content/bafyreigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi",
            sequence,
            b"2100-01-01T00:00:00Z",
            0,
        )
        .unwrap();
        (base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes), keypair)
    }

    #[tokio::test]
    async fn publish_retries_transient_failures_then_succeeds() {
        let storage = Arc::new(InMemoryBackend::new());
        let network = Arc::new(StubNetwork {
            put_calls: AtomicUsize::new(0),
            put_fail_times: 2,
            stored_record: AsyncMutex::new(None),
            get_outcome: None,
        });
        let service = RelayService::new(storage, network);
        let (record_b64, keypair) = sample_record_b64(0);
        let pointer_id = PointerId::new(keypair.pointer_id());
        let user_id = UserId::new("user-1");

        let result = service
            .publish(
                &user_id,
                &pointer_id,
                &record_b64,
                "bafyreigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi",
                None,
                None,
                true,
                RecordType::Root,
            )
            .await
            .unwrap();
        assert_eq!(result.sequence_number, 0);
    }

    #[tokio::test]
    async fn resolve_falls_back_to_cached_tip_on_upstream_unavailable() {
        let storage = Arc::new(InMemoryBackend::new());
        let user_id = UserId::new("user-1");
        let pointer_id = PointerId::new("k".to_string() + &"a".repeat(55));

        storage
            .upsert_pointer_for_publish(&user_id, &pointer_id, "bafyCached", Some(&"aa".repeat(100)), Some(1), true, RecordType::Root, Utc::now())
            .await
            .unwrap();

        let network = Arc::new(StubNetwork {
            put_calls: AtomicUsize::new(0),
            put_fail_times: 0,
            stored_record: AsyncMutex::new(None),
            get_outcome: Some(RelayOutcome::Transient("gateway down".into())),
        });
        let service = RelayService::new(storage, network);

        let result = service.resolve(&user_id, &pointer_id).await.unwrap();
        assert_eq!(result.content_id, "bafyCached");
    }

    #[tokio::test]
    async fn resolve_falls_back_to_cached_tip_on_unparseable_record() {
        let storage = Arc::new(InMemoryBackend::new());
        let user_id = UserId::new("user-1");
        let pointer_id = PointerId::new("k".to_string() + &"a".repeat(55));

        storage
            .upsert_pointer_for_publish(&user_id, &pointer_id, "bafyCached", Some(&"aa".repeat(100)), Some(1), true, RecordType::Root, Utc::now())
            .await
            .unwrap();

        // A field-1 tag (wire type 2) followed by a truncated varint
        // length: `parse_record` can't recover `value`/`sequence` from
        // this, so it always fails, deterministically exercising the
        // parse-error fallback path rather than the network-failure one.
        let unparseable = vec![0x0a, 0xff];
        let network = Arc::new(StubNetwork {
            put_calls: AtomicUsize::new(0),
            put_fail_times: 0,
            stored_record: AsyncMutex::new(Some(unparseable)),
            get_outcome: None,
        });
        let service = RelayService::new(storage, network);

        let result = service.resolve(&user_id, &pointer_id).await.unwrap();
        assert_eq!(result.content_id, "bafyCached");
        assert_eq!(result.sequence_number, 0);
    }

    #[tokio::test]
    async fn resolve_not_found_never_falls_back() {
        let storage = Arc::new(InMemoryBackend::new());
        let user_id = UserId::new("user-1");
        let pointer_id = PointerId::new("k".to_string() + &"a".repeat(55));

        let network = Arc::new(StubNetwork {
            put_calls: AtomicUsize::new(0),
            put_fail_times: 0,
            stored_record: AsyncMutex::new(None),
            get_outcome: Some(RelayOutcome::NotFound),
        });
        let service = RelayService::new(storage, network);

        let err = service.resolve(&user_id, &pointer_id).await.unwrap_err();
        assert!(matches!(err.0, CoreError::NotFound));
    }
}
