//! End-to-end scenario tests combining the vault, relay, scheduler, and
//! epoch services against an `InMemoryBackend`, mirroring the teacher's
//! top-level `tests/` integration convention (`tests/roundtrip.rs`).
//! Each test corresponds to a numbered scenario: first-publish
//! enrollment, resolve-under-outage fallback, and epoch rotation with
//! lazy migration on republish. The remaining numbered scenarios
//! (republish tick, signer-outage backoff, wallet-derivation
//! determinism) already have direct coverage in `scheduler.rs` and
//! `cipherbox-crypto`'s `wallet_derivation.rs` unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use cipherbox_core::epoch::EpochService;
use cipherbox_core::relay::{PointerNetworkClient, RelayOutcome, RelayService};
use cipherbox_core::scheduler::{RepublishEntry, RepublishResponse, RepublishResult, Scheduler, TeeSignerClient};
use cipherbox_core::storage::{InMemoryBackend, StorageBackend};
use cipherbox_core::types::{PointerId, RecordType, UserId};
use cipherbox_core::CoreError;

use cipherbox_crypto::signing::{self, PointerKeypair};

fn record_b64(keypair: &PointerKeypair, content_id: &str, sequence: u64) -> String {
    let bytes = signing::sign_and_marshal_record(keypair, format!("/content/{content_id}").as_bytes(), sequence, b"2100-01-01T00:00:00Z", 0).unwrap();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes)
}

/// A network double that always succeeds and hands back whatever was
/// last published, so tests can drive publish-then-resolve without a
/// live content network.
#[derive(Default)]
struct EchoNetwork {
    stored: tokio::sync::Mutex<Option<Vec<u8>>>,
    unreachable: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl PointerNetworkClient for EchoNetwork {
    async fn put_record(&self, _pointer_id: &str, record_bytes: &[u8]) -> Result<(), RelayOutcome> {
        *self.stored.lock().await = Some(record_bytes.to_vec());
        Ok(())
    }

    async fn get_record(&self, _pointer_id: &str) -> Result<Vec<u8>, RelayOutcome> {
        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RelayOutcome::Transient("gateway down".into()));
        }
        self.stored.lock().await.clone().ok_or(RelayOutcome::NotFound)
    }
}

/// A signer double whose `/republish` response is fixed per test and
/// whose `/public-key` responses are taken from a small epoch->key map,
/// enough to drive the first-publish and outage-fallback scenarios.
struct ScriptedSigner {
    republish: RepublishResponse,
    keys: std::collections::HashMap<u32, Vec<u8>>,
}

#[async_trait]
impl TeeSignerClient for ScriptedSigner {
    async fn republish_batch(&self, _entries: &[RepublishEntry]) -> Result<RepublishResponse, CoreError> {
        Ok(self.republish.clone())
    }

    async fn public_key(&self, epoch: u32) -> Result<Vec<u8>, CoreError> {
        self.keys.get(&epoch).cloned().ok_or(CoreError::NotFound)
    }
}

/// A signer double that reimplements `cipherbox-signer`'s real
/// `unwrap_with_fallback`/`process_entry` rule (epoch keys HKDF-derived
/// from a root seed, decrypt at `key_epoch` falling back to
/// `key_epoch - 1`, lazy rewrap under `key_epoch` when the fallback was
/// the one that worked) using actual ECIES wrap/unwrap, so the epoch
/// rotation scenario drives the real migration path instead of
/// scripting the signer's answer.
struct FallbackSigner {
    seed: [u8; 32],
}

impl FallbackSigner {
    fn epoch_keypair(&self, epoch: u32) -> (Vec<u8>, [u8; 32]) {
        let info = format!("epoch:{epoch}");
        let derived = cipherbox_crypto::kdf::hkdf_sha256(b"cipherbox-signer-epoch-derivation-v1", &self.seed, info.as_bytes(), 32).unwrap();
        let secret_key = secp256k1::SecretKey::from_slice(&derived).unwrap();
        let public_key = secp256k1::PublicKey::from_secret_key(&secp256k1::Secp256k1::new(), &secret_key);
        let mut sk = [0u8; 32];
        sk.copy_from_slice(&derived);
        (public_key.serialize_uncompressed().to_vec(), sk)
    }

    fn unwrap_with_fallback(&self, key_epoch: u32, wrapped: &[u8]) -> Result<([u8; 32], bool), ()> {
        let (_, sk) = self.epoch_keypair(key_epoch);
        if let Ok(seed) = cipherbox_crypto::ecies::unwrap_key(&sk, wrapped) {
            return Ok((*seed, false));
        }
        if key_epoch > 1 {
            let (_, sk_prev) = self.epoch_keypair(key_epoch - 1);
            if let Ok(seed) = cipherbox_crypto::ecies::unwrap_key(&sk_prev, wrapped) {
                return Ok((*seed, true));
            }
        }
        Err(())
    }

    fn process_entry(&self, entry: &RepublishEntry) -> RepublishResult {
        let pointer_id = entry.pointer_id.clone();
        let wrapped_bytes = match hex::decode(&entry.wrapped_signing_key) {
            Ok(bytes) => bytes,
            Err(_) => return Self::failure(pointer_id, "wrapped_signing_key is not valid hex"),
        };

        let (mut seed, rewrap_from_previous) = match self.unwrap_with_fallback(entry.key_epoch, &wrapped_bytes) {
            Ok(result) => result,
            Err(_) => return Self::failure(pointer_id, "cannot decrypt"),
        };

        let keypair = PointerKeypair::from_seed(&seed);
        let value = format!("/content/{}", entry.latest_content_id);
        let sequence = entry.sequence_number + 1;
        let signed_record = signing::sign_and_marshal_record(&keypair, value.as_bytes(), sequence, b"2100-01-01T00:00:00Z", 0).unwrap();
        use zeroize::Zeroize;
        seed.zeroize();

        let mut result = RepublishResult {
            pointer_id,
            success: true,
            signed_record: Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &signed_record)),
            new_sequence_number: Some(sequence),
            rewrapped_signing_key: None,
            rewrapped_to_epoch: None,
            error: None,
        };

        if rewrap_from_previous {
            let (current_pub, _) = self.epoch_keypair(entry.key_epoch);
            let mut seed_for_rewrap = match self.unwrap_with_fallback(entry.key_epoch, &wrapped_bytes) {
                Ok((seed, _)) => seed,
                Err(_) => return Self::failure(result.pointer_id, "cannot decrypt for rewrap"),
            };
            if let Ok(rewrapped) = cipherbox_crypto::ecies::wrap_key(&current_pub, &seed_for_rewrap) {
                result.rewrapped_signing_key = Some(hex::encode(rewrapped));
                result.rewrapped_to_epoch = Some(entry.key_epoch);
            }
            seed_for_rewrap.zeroize();
        }

        result
    }

    fn failure(pointer_id: String, message: &str) -> RepublishResult {
        RepublishResult {
            pointer_id,
            success: false,
            signed_record: None,
            new_sequence_number: None,
            rewrapped_signing_key: None,
            rewrapped_to_epoch: None,
            error: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl TeeSignerClient for FallbackSigner {
    async fn republish_batch(&self, entries: &[RepublishEntry]) -> Result<RepublishResponse, CoreError> {
        Ok(RepublishResponse { results: entries.iter().map(|entry| self.process_entry(entry)).collect() })
    }

    async fn public_key(&self, epoch: u32) -> Result<Vec<u8>, CoreError> {
        Ok(self.epoch_keypair(epoch).0)
    }
}

fn test_pointer(keypair: &PointerKeypair) -> PointerId {
    PointerId::new(keypair.pointer_id())
}

/// Scenario 1: a first-time publish with TEE enrollment fields creates
/// both the `folder_pointers` row and an `active` republish schedule
/// due roughly six hours out.
#[tokio::test]
async fn first_time_publish_enrolls_for_republishing() {
    let storage = Arc::new(InMemoryBackend::new());
    let network = Arc::new(EchoNetwork::default());
    let relay = RelayService::new(storage.clone(), network);

    let user_id = UserId::new("user-1");
    let keypair = PointerKeypair::generate();
    let pointer_id = test_pointer(&keypair);
    let record = record_b64(&keypair, "bafyreigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi", 0);

    let now = Utc::now();
    let result = relay
        .publish(
            &user_id,
            &pointer_id,
            &record,
            "bafyreigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi",
            Some(&"aa".repeat(100)),
            Some(1),
            true,
            RecordType::Root,
        )
        .await
        .unwrap();
    assert_eq!(result.sequence_number, 0);

    let schedule = storage.get_schedule(&pointer_id).await.unwrap().expect("schedule row created");
    assert_eq!(schedule.status, cipherbox_core::types::ScheduleStatus::Active);
    assert_eq!(schedule.key_epoch, 1);
    assert!(schedule.next_run_at > now + ChronoDuration::hours(5));
    assert!(schedule.next_run_at < now + ChronoDuration::hours(7));
}

/// Scenario 2: upstream returns an error but a cached tip exists in the
/// schedule row, so resolve serves the cached value rather than failing.
#[tokio::test]
async fn resolve_falls_back_to_cached_tip_after_upstream_outage() {
    let storage = Arc::new(InMemoryBackend::new());
    let network = Arc::new(EchoNetwork::default());
    network.unreachable.store(true, std::sync::atomic::Ordering::SeqCst);
    let relay = RelayService::new(storage.clone(), network);

    let user_id = UserId::new("user-1");
    let pointer_id = PointerId::new("k".to_string() + &"a".repeat(55));
    // A pointer already enrolled for republishing (as in
    // `first_time_publish_enrolls_for_republishing`) has a schedule row
    // carrying the last known-good tip; resolve falls back to it.
    storage
        .put_schedule(&cipherbox_core::types::RepublishSchedule {
            pointer_id: pointer_id.clone(),
            user_id: user_id.clone(),
            status: cipherbox_core::types::ScheduleStatus::Active,
            wrapped_signing_key: "aa".repeat(100),
            key_epoch: 1,
            last_content_id: "bafyCACHED".to_string(),
            last_sequence_number: 42,
            next_run_at: Utc::now() + ChronoDuration::hours(6),
            last_run_at: None,
            consecutive_failures: 0,
        })
        .await
        .unwrap();

    let result = relay.resolve(&user_id, &pointer_id).await.unwrap();
    assert_eq!(result.content_id, "bafyCACHED");
    assert_eq!(result.sequence_number, 42);
    assert!(result.signature_bundle.is_none());
}

/// Scenario 5: epoch rotation with lazy migration. A schedule entry
/// wrapped under the deprecated epoch gets rewrapped under the new
/// epoch on its next republish tick. This drives the real
/// decrypt-with-fallback / rewrap rule end to end through the scheduler
/// (`FallbackSigner` above reimplements `cipherbox-signer`'s actual
/// per-entry logic rather than scripting its output), so it also
/// exercises the scheduler's own fix of sending the *live* epoch
/// (tracked by `EpochService`) rather than the schedule row's stale
/// stored epoch: without that, the signer's direct decrypt at epoch 1
/// would always succeed and the fallback/rewrap path would never fire.
#[tokio::test]
async fn epoch_rotation_rewraps_entries_on_next_republish() {
    let storage = Arc::new(InMemoryBackend::new());
    let epoch = Arc::new(EpochService::new(storage.clone()));
    let signer = Arc::new(FallbackSigner { seed: [7u8; 32] });

    let (epoch1_pub, _) = signer.epoch_keypair(1);
    let (epoch2_pub, _) = signer.epoch_keypair(2);
    epoch.initialize(epoch1_pub.clone()).await.unwrap();

    let now = Utc::now();
    let rotated = epoch.rotate(2, epoch2_pub, "scheduled rotation", now).await.unwrap();
    assert_eq!(rotated.current_epoch, 2);
    assert_eq!(rotated.previous_epoch, Some(1));
    assert_eq!(rotated.previous_deprecation_at, Some(now + cipherbox_core::epoch::GRACE_WINDOW));
    assert!(!epoch.previous_epoch_deprecated(now).await.unwrap());

    let network = Arc::new(EchoNetwork::default());
    let relay = Arc::new(RelayService::new(storage.clone(), network));

    let user_id = UserId::new("user-1");
    let keypair = PointerKeypair::generate();
    let pointer_id = test_pointer(&keypair);

    // Wrap the pointer's real signing seed under epoch 1's key, so the
    // schedule row is enrolled with `key_epoch: 1`, exactly as it would
    // be from a publish that happened before the rotation above. The
    // signer's direct decrypt at epoch 1 would trivially succeed if the
    // scheduler (incorrectly) sent `key_epoch: 1` instead of the live
    // epoch tracked by `EpochService`. That's the bug this scenario
    // now catches.
    let seed = keypair.seed_bytes();
    let wrapped_under_epoch1 = cipherbox_crypto::ecies::wrap_key(&epoch1_pub, &seed).unwrap();
    let wrapped_hex = hex::encode(&wrapped_under_epoch1);
    storage
        .upsert_pointer_for_publish(
            &user_id,
            &pointer_id,
            "bafyOld",
            Some(&wrapped_hex),
            Some(1),
            true,
            RecordType::Root,
            now - ChronoDuration::hours(7),
        )
        .await
        .unwrap();

    let scheduler = Scheduler::new(storage.clone(), signer.clone(), relay, epoch.clone());
    let report = scheduler.run_tick(now).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);

    let schedule = storage.get_schedule(&pointer_id).await.unwrap().unwrap();
    assert_eq!(schedule.key_epoch, 2);
    assert_ne!(schedule.wrapped_signing_key, wrapped_hex);
    assert_eq!(schedule.last_sequence_number, 1);
    assert_eq!(schedule.consecutive_failures, 0);

    // The rewrapped key now decrypts directly under epoch 2, with no
    // fallback needed: the migration completed.
    let rewrapped_bytes = hex::decode(&schedule.wrapped_signing_key).unwrap();
    let (_, sk_epoch2) = signer.epoch_keypair(2);
    let unwrapped = cipherbox_crypto::ecies::unwrap_key(&sk_epoch2, &rewrapped_bytes).unwrap();
    assert_eq!(&*unwrapped, &*seed);
}
