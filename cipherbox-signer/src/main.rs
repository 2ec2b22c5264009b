//! CipherBox TEE Signer Worker (§4.6).
//!
//! An independent process, reachable only over the loopback or a
//! controlled transport, that holds no long-term secrets of its own:
//! every epoch keypair is derived on demand from the worker's root seed
//! and never persisted. Structurally grounded on
//! `citadel-api/src/main.rs` (axum app construction, `tracing-subscriber`
//! bootstrap, bearer-token auth middleware using
//! `subtle::ConstantTimeEq`), repurposed for a second, much smaller
//! binary with no dashboard and no API-key store.
//!
//! Configuration (environment variables):
//!   CIPHERBOX_SIGNER_PORT            - Listen port (default: 8081)
//!   CIPHERBOX_SIGNER_BEARER_SECRET   - Shared bearer secret, required
//!   CIPHERBOX_SIGNER_SEED            - Hex-encoded 32-byte simulator seed
//!   CIPHERBOX_LOG_FORMAT             - "json" for structured logging, "pretty" for dev

mod modes;

use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use cipherbox_crypto::ecies;
use cipherbox_crypto::signing::PointerKeypair;
use modes::{derive_epoch_keypair, EpochKeypair, SignerMode};

const VALIDITY_HOURS: i64 = 48;

struct AppState {
    mode: SignerMode,
    bearer_secret: String,
    started_at: Instant,
    public_key_cache: RwLock<std::collections::HashMap<u32, Vec<u8>>>,
}

type Shared = Arc<AppState>;

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(State(state): State<Shared>, req: axum::extract::Request, next: Next) -> impl IntoResponse {
    if req.uri().path() == "/health" {
        return next.run(req).await.into_response();
    }

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if bool::from(token.as_bytes().ct_eq(state.bearer_secret.as_bytes())) => next.run(req).await.into_response(),
        _ => {
            tracing::warn!(path = %req.uri().path(), "signer auth failed");
            (StatusCode::UNAUTHORIZED, Json(ApiError { error: "authentication failed".into() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Serialize, Clone)]
struct ApiError {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    mode: &'static str,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct PublicKeyQuery {
    epoch: u32,
}

#[derive(Serialize)]
struct PublicKeyResponse {
    epoch: u32,
    public_key: String,
}

#[derive(Deserialize)]
struct RepublishEntryReq {
    pointer_id: String,
    wrapped_signing_key: String,
    key_epoch: u32,
    latest_content_id: String,
    sequence_number: u64,
}

#[derive(Deserialize)]
struct RepublishRequest {
    entries: Vec<RepublishEntryReq>,
}

#[derive(Serialize)]
struct RepublishEntryResult {
    pointer_id: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    signed_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_sequence_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rewrapped_signing_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rewrapped_to_epoch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct RepublishResponse {
    results: Vec<RepublishEntryResult>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

async fn health(State(state): State<Shared>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        mode: state.mode.label(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn public_key(State(state): State<Shared>, Query(query): Query<PublicKeyQuery>) -> impl IntoResponse {
    if let Some(cached) = state.public_key_cache.read().unwrap().get(&query.epoch) {
        return Json(PublicKeyResponse { epoch: query.epoch, public_key: hex::encode(cached) }).into_response();
    }

    match derive_epoch_keypair(&state.mode, query.epoch) {
        Ok(keypair) => {
            state.public_key_cache.write().unwrap().insert(query.epoch, keypair.public_key.clone());
            Json(PublicKeyResponse { epoch: query.epoch, public_key: hex::encode(&keypair.public_key) }).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError { error: e.to_string() })).into_response(),
    }
}

async fn republish(State(state): State<Shared>, Json(req): Json<RepublishRequest>) -> impl IntoResponse {
    let results: Vec<RepublishEntryResult> = req.entries.into_iter().map(|entry| process_entry(&state, entry)).collect();
    Json(RepublishResponse { results })
}

/// One entry of §4.6's per-entry procedure: decrypt-with-fallback across
/// epochs, ECIES-unwrap to an Ed25519 seed, sign, marshal, zero, and
/// opportunistically rewrap under the current epoch when the fallback
/// path was taken (lazy migration, §4.7).
///
/// The fallback epoch is always `key_epoch - 1`: this worker derives
/// every epoch's keypair deterministically from its own root seed, so
/// there is no local "current epoch" to compare against — the caller
/// (which does track `TeeEpochState`) only ever sends a `key_epoch` that
/// is either the live epoch or its immediate predecessor during a grace
/// window, so a single-step-back retry covers every real case.
fn process_entry(state: &AppState, entry: RepublishEntryReq) -> RepublishEntryResult {
    let pointer_id = entry.pointer_id.clone();
    let wrapped_bytes = match hex::decode(&entry.wrapped_signing_key) {
        Ok(bytes) => bytes,
        Err(_) => return failure(pointer_id, "wrapped_signing_key is not valid hex"),
    };

    let (mut seed, rewrap_from_previous) = match unwrap_with_fallback(state, entry.key_epoch, &wrapped_bytes) {
        Ok(result) => result,
        Err(_) => return failure(pointer_id, "cannot decrypt"),
    };

    let result = sign_entry(&entry, &seed);
    seed.zeroize();

    let mut result = match result {
        Ok(result) => result,
        Err(e) => return failure(pointer_id, &e.to_string()),
    };

    if rewrap_from_previous {
        match derive_epoch_keypair(&state.mode, entry.key_epoch) {
            Ok(current) => {
                let mut seed_for_rewrap = match unwrap_with_fallback(state, entry.key_epoch, &wrapped_bytes) {
                    Ok((seed, _)) => seed,
                    Err(_) => return failure(pointer_id, "cannot decrypt for rewrap"),
                };
                match ecies::wrap_key(&current.public_key, &seed_for_rewrap) {
                    Ok(rewrapped) => {
                        result.rewrapped_signing_key = Some(hex::encode(rewrapped));
                        result.rewrapped_to_epoch = Some(entry.key_epoch);
                    }
                    Err(e) => tracing::warn!(pointer_id = %entry.pointer_id, error = %e, "lazy rewrap failed, entry still republished"),
                }
                seed_for_rewrap.zeroize();
            }
            Err(e) => tracing::warn!(pointer_id = %entry.pointer_id, error = %e, "could not derive current epoch key for rewrap"),
        }
    }

    result
}

/// Try `key_epoch` first; on failure, try `key_epoch - 1`. Returns the
/// unwrapped 32-byte Ed25519 seed and whether the fallback epoch was
/// the one that actually worked.
fn unwrap_with_fallback(state: &AppState, key_epoch: u32, wrapped: &[u8]) -> Result<([u8; 32], bool), ()> {
    if let Ok(keypair) = derive_epoch_keypair(&state.mode, key_epoch) {
        if let Ok(seed) = ecies::unwrap_key(&keypair.private_key, wrapped) {
            return Ok((*seed, false));
        }
    }
    if key_epoch > 1 {
        if let Ok(keypair) = derive_epoch_keypair(&state.mode, key_epoch - 1) {
            if let Ok(seed) = ecies::unwrap_key(&keypair.private_key, wrapped) {
                return Ok((*seed, true));
            }
        }
    }
    Err(())
}

fn sign_entry(entry: &RepublishEntryReq, seed: &[u8; 32]) -> Result<RepublishEntryResult, cipherbox_crypto::CryptoKind> {
    let keypair = PointerKeypair::from_seed(seed);
    let value = format!("/content/{}", entry.latest_content_id);
    let sequence = entry.sequence_number + 1;
    let validity = (Utc::now() + chrono::Duration::hours(VALIDITY_HOURS)).to_rfc3339();

    let record_bytes = cipherbox_crypto::signing::sign_and_marshal_record(&keypair, value.as_bytes(), sequence, validity.as_bytes(), 0)?;

    Ok(RepublishEntryResult {
        pointer_id: entry.pointer_id.clone(),
        success: true,
        signed_record: Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &record_bytes)),
        new_sequence_number: Some(sequence),
        rewrapped_signing_key: None,
        rewrapped_to_epoch: None,
        error: None,
    })
}

fn failure(pointer_id: String, message: &str) -> RepublishEntryResult {
    RepublishEntryResult {
        pointer_id,
        success: false,
        signed_record: None,
        new_sequence_number: None,
        rewrapped_signing_key: None,
        rewrapped_to_epoch: None,
        error: Some(message.to_string()),
    }
}

#[tokio::main]
async fn main() {
    let log_format = std::env::var("CIPHERBOX_LOG_FORMAT").unwrap_or_else(|_| "pretty".into());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cipherbox_signer=info,tower_http=info".into());
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).with_target(true).with_thread_ids(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let port: u16 = std::env::var("CIPHERBOX_SIGNER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8081);
    let bearer_secret = std::env::var("CIPHERBOX_SIGNER_BEARER_SECRET")
        .unwrap_or_else(|_| { tracing::error!("CIPHERBOX_SIGNER_BEARER_SECRET not set"); std::process::exit(1) });

    let seed_hex = std::env::var("CIPHERBOX_SIGNER_SEED").unwrap_or_else(|_| {
        tracing::warn!("CIPHERBOX_SIGNER_SEED not set, using an ephemeral simulator seed");
        hex::encode([0u8; 32])
    });
    let seed_bytes = hex::decode(&seed_hex).unwrap_or_else(|_| { tracing::error!("CIPHERBOX_SIGNER_SEED is not valid hex"); std::process::exit(1) });
    if seed_bytes.len() != 32 {
        tracing::error!("CIPHERBOX_SIGNER_SEED must decode to exactly 32 bytes");
        std::process::exit(1);
    }
    let mut seed = zeroize::Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(&seed_bytes);

    let state: Shared = Arc::new(AppState {
        mode: SignerMode::Simulator { seed },
        bearer_secret,
        started_at: Instant::now(),
        public_key_cache: RwLock::new(std::collections::HashMap::new()),
    });

    let EpochKeypair { public_key, .. } = derive_epoch_keypair(&state.mode, 1).expect("epoch 1 derivation must succeed at boot");
    tracing::info!(epoch = 1, public_key = %hex::encode(&public_key), "derived initial epoch key");

    let cors = tower_http::cors::CorsLayer::new().allow_origin(tower_http::cors::Any).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/public-key", get(public_key))
        .route("/republish", post(republish))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(cors)
        .with_state(state);

    tracing::info!(port, mode = "simulator", "starting CipherBox TEE signer");
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
