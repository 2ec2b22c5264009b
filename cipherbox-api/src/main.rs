//! CipherBox public HTTP surface (§6): vault lifecycle, the mutable-
//! pointer publish/resolve contract, and the admin health/operator
//! surface (§4.8), plus the long-lived republish cron loop (§4.5).
//!
//! Structurally grounded on `citadel-api/src/main.rs`: a single
//! `AppState` behind an `Arc`, bearer-token middleware that inserts an
//! auth context into request extensions, a hand-rolled token-bucket
//! rate limiter swept on a background interval, and a `tracing-subscriber`
//! bootstrap toggled between pretty/json by one env var. Identity
//! issuance itself is the external collaborator the specification
//! treats as a black box (§1) — the bearer token this binary verifies is
//! assumed already-authenticated upstream and is used here only as the
//! stable user ID it names.
//!
//! Configuration: see [`cipherbox_core::config::Config`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::cors::{Any, CorsLayer};

use cipherbox_core::config::{Config, LogFormat};
use cipherbox_core::epoch::EpochService;
use cipherbox_core::error::CoreError;
use cipherbox_core::rate_limit::RateLimiter;
use cipherbox_core::relay::{HttpPointerNetworkClient, RelayService};
use cipherbox_core::scheduler::{HttpTeeSignerClient, Scheduler, TeeSignerClient};
use cipherbox_core::storage::{InMemoryBackend, StorageBackend};
use cipherbox_core::types::{PointerId, RecordType, RequestContext, User, UserId, Vault};
use cipherbox_core::vault::VaultService;
use cipherbox_core::{audit, validate};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    storage: Arc<dyn StorageBackend>,
    vault: VaultService,
    relay: Arc<RelayService>,
    scheduler: Arc<Scheduler>,
    epoch: Arc<EpochService>,
    signer: Arc<dyn TeeSignerClient>,
    publish_rate_limiter: RateLimiter,
    admin_bearer_secret: String,
}

type Shared = Arc<AppState>;

// ---------------------------------------------------------------------------
// Auth context
// ---------------------------------------------------------------------------

/// The stable user ID the external identity collaborator vouches for.
/// Inserted into request extensions by [`user_auth_middleware`].
#[derive(Clone, Debug)]
struct AuthedUser(UserId);

fn bearer_token(req: &axum::extract::Request) -> Option<&str> {
    req.headers().get(header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

async fn user_auth_middleware(mut req: axum::extract::Request, next: Next) -> impl IntoResponse {
    match bearer_token(&req) {
        Some(token) if !token.is_empty() => {
            req.extensions_mut().insert(AuthedUser(UserId::new(token.to_string())));
            next.run(req).await.into_response()
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ApiError { error: "missing Authorization header (use: Bearer <user-id-token>)".into() }),
        )
            .into_response(),
    }
}

async fn admin_auth_middleware(State(state): State<Shared>, req: axum::extract::Request, next: Next) -> impl IntoResponse {
    match bearer_token(&req) {
        Some(token) if bool::from(token.as_bytes().ct_eq(state.admin_bearer_secret.as_bytes())) => {
            next.run(req).await.into_response()
        }
        _ => {
            tracing::warn!(path = %req.uri().path(), "admin auth failed");
            (StatusCode::UNAUTHORIZED, Json(ApiError { error: "authentication failed".into() })).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response DTOs (§6)
// ---------------------------------------------------------------------------

#[derive(Serialize, Clone)]
struct ApiError {
    error: String,
}

#[derive(Deserialize)]
struct RegisterUserRequest {
    user_id: String,
    /// Uncompressed 65-byte secp256k1 public key, hex-encoded.
    public_key: String,
    #[serde(default)]
    derivation_version: u32,
}

#[derive(Deserialize)]
struct VaultInitRequest {
    wrapped_root_key: String,
    root_pointer_id: String,
}

#[derive(Serialize)]
struct TeeKeysView {
    current_epoch: u32,
    current_public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_epoch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_public_key: Option<String>,
}

#[derive(Serialize)]
struct VaultGetResponse {
    wrapped_root_key: String,
    root_pointer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tee_keys: Option<TeeKeysView>,
}

#[derive(Deserialize)]
struct PublishRequest {
    record: String,
    referenced_content_id: String,
    #[serde(default)]
    wrapped_signing_key: Option<String>,
    #[serde(default)]
    key_epoch: Option<u32>,
}

#[derive(Serialize)]
struct PublishResponse {
    success: bool,
    pointer_id: String,
    sequence_number: String,
}

#[derive(Serialize)]
struct ResolveResponse {
    success: bool,
    content_id: String,
    sequence_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
}

#[derive(Serialize)]
struct AdminHealthResponse {
    pending_jobs: u64,
    failed_jobs: u64,
    stale_jobs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_tick_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_epoch: Option<u32>,
    signer_reachable: bool,
}

#[derive(Deserialize)]
struct RotateEpochRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize)]
struct RotateEpochResponse {
    success: bool,
    current_epoch: u32,
}

// ---------------------------------------------------------------------------
// Error mapping (§7)
// ---------------------------------------------------------------------------

fn core_error_response(err: CoreError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CoreError::Forbidden => StatusCode::FORBIDDEN,
        CoreError::AuthFailure => StatusCode::BAD_REQUEST,
        CoreError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
        CoreError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        CoreError::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
        CoreError::SignerUnavailable(_) => StatusCode::BAD_GATEWAY,
        CoreError::NotFound => StatusCode::NOT_FOUND,
        CoreError::DerivationRange => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // Client-visible message is generic; the full `Display` (which may
    // embed request content for `InvalidInput`/`InvalidRecord`, or an
    // upstream status code for `UpstreamUnavailable`/`SignerUnavailable`)
    // never leaves the process except for the validation feedback those
    // first two variants already choose to surface.
    let message = match &err {
        CoreError::UpstreamUnavailable(_) => "upstream content network unavailable".to_string(),
        CoreError::SignerUnavailable(_) => "signer unavailable".to_string(),
        _ => err.to_string(),
    };
    (status, Json(ApiError { error: message }))
}

fn err(msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError { error: msg.into() }))
}

/// Short, client-safe tag for the audit log (per [`audit`]'s contract:
/// never the full `Display`, which for `InvalidInput`/`InvalidRecord`
/// may echo back request content).
fn error_tag(e: &CoreError) -> &'static str {
    match e {
        CoreError::InvalidInput(_) => "InvalidInput",
        CoreError::Unauthenticated => "Unauthenticated",
        CoreError::Forbidden => "Forbidden",
        CoreError::AuthFailure => "AuthFailure",
        CoreError::InvalidRecord(_) => "InvalidRecord",
        CoreError::UpstreamUnavailable(_) => "UpstreamUnavailable",
        CoreError::RateLimited => "RateLimited",
        CoreError::QuotaExceeded => "QuotaExceeded",
        CoreError::SignerUnavailable(_) => "SignerUnavailable",
        CoreError::NotFound => "NotFound",
        CoreError::DerivationRange => "DerivationRange",
        CoreError::Fatal(_) => "Fatal",
    }
}

// ---------------------------------------------------------------------------
// Routes — health
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// Routes — admin: user registration (§1 bridges the out-of-scope
// identity collaborator), health, schedule reactivation, epoch rotation
// ---------------------------------------------------------------------------

async fn register_user(State(state): State<Shared>, Json(req): Json<RegisterUserRequest>) -> impl IntoResponse {
    let public_key = match hex::decode(&req.public_key) {
        Ok(bytes) if bytes.len() == 65 && bytes[0] == 0x04 => bytes,
        Ok(_) => return err("public_key must be a 65-byte uncompressed secp256k1 key (hex)").into_response(),
        Err(e) => return err(format!("public_key is not valid hex: {e}")).into_response(),
    };

    let user = User { user_id: UserId::new(req.user_id.clone()), public_key, derivation_version: req.derivation_version };
    match state.storage.put_user(&user).await {
        Ok(()) => (StatusCode::CREATED, Json(serde_json::json!({"success": true, "user_id": req.user_id}))).into_response(),
        Err(e) => core_error_response(e).into_response(),
    }
}

async fn admin_health(State(state): State<Shared>) -> impl IntoResponse {
    let now = Utc::now();
    let counts = match state.storage.schedule_health_counts(now).await {
        Ok(c) => c,
        Err(e) => return core_error_response(e).into_response(),
    };
    let current_epoch = state.epoch.current_state().await.ok().map(|s| s.current_epoch);
    let last_tick_at = state.scheduler.last_tick_at().await.map(|t| t.to_rfc3339());
    let signer_reachable = state.scheduler.signer_reachable().await;

    Json(AdminHealthResponse {
        pending_jobs: counts.pending_jobs,
        failed_jobs: counts.failed_jobs,
        stale_jobs: counts.stale_jobs,
        last_tick_at,
        current_epoch,
        signer_reachable,
    })
    .into_response()
}

async fn admin_reactivate_schedule(State(state): State<Shared>, Path(pointer_id): Path<String>) -> impl IntoResponse {
    match state.scheduler.reactivate(&PointerId::new(pointer_id), Utc::now()).await {
        Ok(()) => Json(serde_json::json!({"success": true})).into_response(),
        Err(e) => core_error_response(e.0).into_response(),
    }
}

async fn admin_rotate_epoch(State(state): State<Shared>, Json(req): Json<RotateEpochRequest>) -> impl IntoResponse {
    let current = match state.epoch.current_state().await {
        Ok(s) => s,
        Err(e) => return core_error_response(e.0).into_response(),
    };
    let new_epoch = current.current_epoch + 1;
    let new_public_key = match state.signer.public_key(new_epoch).await {
        Ok(key) => key,
        Err(e) => return core_error_response(e).into_response(),
    };
    let reason = req.reason.unwrap_or_else(|| "operator rotation".to_string());
    match state.epoch.rotate(new_epoch, new_public_key, &reason, Utc::now()).await {
        Ok(rotated) => Json(RotateEpochResponse { success: true, current_epoch: rotated.current_epoch }).into_response(),
        Err(e) => core_error_response(e.0).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Routes — vault (§4.3, §6)
// ---------------------------------------------------------------------------

async fn vault_init(State(state): State<Shared>, Extension(AuthedUser(user_id)): Extension<AuthedUser>, Json(req): Json<VaultInitRequest>) -> impl IntoResponse {
    if state.storage.get_user(&user_id).await.ok().flatten().is_none() {
        return core_error_response(CoreError::Unauthenticated).into_response();
    }
    if let Err(e) = validate::validate_pointer_id(&req.root_pointer_id) {
        return err(e.to_string()).into_response();
    }
    let wrapped_root_key = match hex::decode(&req.wrapped_root_key) {
        Ok(bytes) => bytes,
        Err(e) => return err(format!("wrapped_root_key is not valid hex: {e}")).into_response(),
    };

    let now = Utc::now();
    let vault = Vault {
        user_id: user_id.clone(),
        wrapped_root_key,
        root_pointer_id: PointerId::new(req.root_pointer_id),
        created_at: now,
        updated_at: now,
    };

    let ctx = RequestContext::new("vault.init").with_user(user_id);
    match state.vault.init_vault(&vault).await {
        Ok(()) => {
            audit::log_success(&ctx);
            (StatusCode::CREATED, Json(serde_json::json!({"success": true}))).into_response()
        }
        Err(e) => {
            audit::log_failure(&ctx, error_tag(&e.0));
            core_error_response(e.0).into_response()
        }
    }
}

async fn vault_get(State(state): State<Shared>, Extension(AuthedUser(user_id)): Extension<AuthedUser>) -> impl IntoResponse {
    let vault = match state.vault.get_vault(&user_id).await {
        Ok(v) => v,
        Err(e) => return core_error_response(e.0).into_response(),
    };

    let tee_keys = state.epoch.current_state().await.ok().map(|s| TeeKeysView {
        current_epoch: s.current_epoch,
        current_public_key: hex::encode(&s.current_public_key),
        previous_epoch: s.previous_epoch,
        previous_public_key: s.previous_public_key.as_ref().map(hex::encode),
    });

    Json(VaultGetResponse {
        wrapped_root_key: hex::encode(&vault.wrapped_root_key),
        root_pointer_id: vault.root_pointer_id.as_str().to_string(),
        tee_keys,
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Routes — mutable-pointer relay (§4.4, §6)
// ---------------------------------------------------------------------------

async fn publish(
    State(state): State<Shared>,
    Extension(AuthedUser(user_id)): Extension<AuthedUser>,
    Path(pointer_id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> impl IntoResponse {
    if !state.publish_rate_limiter.check_user(&user_id).await {
        return core_error_response(CoreError::RateLimited).into_response();
    }

    let pointer_id = PointerId::new(pointer_id);
    let ctx = RequestContext::new("pointer.publish").with_user(user_id.clone()).with_pointer(pointer_id.clone());

    match state.storage.pointer_owner(&pointer_id).await {
        Ok(Some(owner)) if owner != user_id => {
            audit::log_failure(&ctx, "Forbidden");
            return core_error_response(CoreError::Forbidden).into_response();
        }
        Ok(_) => {}
        Err(e) => return core_error_response(e).into_response(),
    }

    let vault = match state.vault.get_vault(&user_id).await {
        Ok(v) => v,
        Err(e) => return core_error_response(e.0).into_response(),
    };
    let is_root = pointer_id.as_str() == vault.root_pointer_id.as_str();
    let record_type = if is_root { RecordType::Root } else { RecordType::Folder };

    let result = state
        .relay
        .publish(
            &user_id,
            &pointer_id,
            &req.record,
            &req.referenced_content_id,
            req.wrapped_signing_key.as_deref(),
            req.key_epoch,
            is_root,
            record_type,
        )
        .await;

    match result {
        Ok(result) => {
            audit::log_success(&ctx);
            Json(PublishResponse {
                success: true,
                pointer_id: pointer_id.as_str().to_string(),
                sequence_number: result.sequence_number.to_string(),
            })
            .into_response()
        }
        Err(e) => {
            audit::log_failure(&ctx, error_tag(&e.0));
            core_error_response(e.0).into_response()
        }
    }
}

async fn resolve(State(state): State<Shared>, Extension(AuthedUser(user_id)): Extension<AuthedUser>, Path(pointer_id): Path<String>) -> impl IntoResponse {
    if let Err(e) = validate::validate_pointer_id(&pointer_id) {
        return err(e.to_string()).into_response();
    }
    let pointer_id = PointerId::new(pointer_id);
    let ctx = RequestContext::new("pointer.resolve").with_user(user_id.clone()).with_pointer(pointer_id.clone());

    match state.relay.resolve(&user_id, &pointer_id).await {
        Ok(result) => {
            audit::log_success(&ctx);
            let (signature, data, public_key) = match result.signature_bundle {
                Some(bundle) => (
                    Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bundle.signature)),
                    Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bundle.data)),
                    Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bundle.public_key)),
                ),
                None => (None, None, None),
            };
            Json(ResolveResponse { success: true, content_id: result.content_id, sequence_number: result.sequence_number, signature, data, public_key })
                .into_response()
        }
        Err(e) => {
            audit::log_failure(&ctx, error_tag(&e.0));
            core_error_response(e.0).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Seed §4.7's epoch state at first boot by asking the signer for
/// epoch 1's public key. A best-effort call: if the signer is not yet
/// reachable, epoch state stays empty and `vault_get`/`admin_health`
/// degrade gracefully until an operator retries (e.g. via a restart or
/// the next successful signer round-trip, after which `epoch.initialize`
/// — idempotent — is safe to call again).
async fn bootstrap_epoch_state(epoch: &EpochService, signer: &dyn TeeSignerClient) {
    match signer.public_key(1).await {
        Ok(public_key) => match epoch.initialize(public_key).await {
            Ok(state) => tracing::info!(current_epoch = state.current_epoch, "epoch state ready"),
            Err(e) => tracing::error!(error = %e, "failed to persist initial epoch state"),
        },
        Err(e) => tracing::warn!(error = %e, "signer unreachable at boot, epoch state left uninitialized"),
    }
}

async fn run_republish_cron(cron: &str, scheduler: Arc<Scheduler>) -> Result<JobScheduler, Box<dyn std::error::Error>> {
    let job_scheduler = JobScheduler::new().await?;
    let job = Job::new_async(cron, move |_uuid, _scheduler_handle| {
        let scheduler = scheduler.clone();
        Box::pin(async move {
            match scheduler.run_tick(Utc::now()).await {
                Ok(report) => tracing::info!(
                    processed = report.processed,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    went_stale = report.went_stale,
                    "republish tick complete"
                ),
                Err(e) => tracing::error!(error = %e, "republish tick failed"),
            }
        })
    })?;
    job_scheduler.add(job).await?;
    job_scheduler.start().await?;
    Ok(job_scheduler)
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    });

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "cipherbox_api=info,tower_http=info".into());
    if config.log_format == LogFormat::Json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).with_target(true).with_thread_ids(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    // Swap for a `sqlx`-backed Postgres implementation of
    // `StorageBackend` in production; the trait and its persisted-state
    // shape (§6) are already load-bearing, only the backing store here
    // is a placeholder.
    let storage: Arc<dyn StorageBackend> = InMemoryBackend::shared();

    let network = Arc::new(HttpPointerNetworkClient::new(config.content_network_url.clone()));
    let relay = Arc::new(RelayService::new(storage.clone(), network));

    let signer: Arc<dyn TeeSignerClient> = Arc::new(HttpTeeSignerClient::new(config.signer_url.clone(), config.signer_bearer_secret.clone()));

    let grace_window = chrono::Duration::from_std(config.grace_window).unwrap_or(cipherbox_core::epoch::GRACE_WINDOW);
    let epoch = Arc::new(EpochService::new(storage.clone()).with_grace_window(grace_window));
    bootstrap_epoch_state(&epoch, signer.as_ref()).await;

    let scheduler = Arc::new(Scheduler::new(storage.clone(), signer.clone(), relay.clone(), epoch.clone()));

    let vault = VaultService::new(storage.clone());

    let publish_rate_limiter = RateLimiter::per_minute(config.publish_rate_per_min as f64, config.publish_rate_per_min as f64);

    let state: Shared = Arc::new(AppState {
        storage,
        vault,
        relay,
        scheduler: scheduler.clone(),
        epoch,
        signer: signer.clone(),
        publish_rate_limiter,
        admin_bearer_secret: config.admin_bearer_secret.clone(),
    });

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweep_state.publish_rate_limiter.sweep_idle(300).await;
        }
    });

    let _cron_handle = match run_republish_cron(&config.republish_cron, scheduler).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(error = %e, "failed to start republish cron, republishing is disabled");
            None
        }
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let admin_routes = Router::new()
        .route("/v1/admin/users", post(register_user))
        .route("/v1/admin/health", get(admin_health))
        .route("/v1/admin/schedule/:pointer_id/reactivate", post(admin_reactivate_schedule))
        .route("/v1/admin/epoch/rotate", post(admin_rotate_epoch))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    let user_routes = Router::new()
        .route("/v1/vault", post(vault_init).get(vault_get))
        .route("/v1/pointers/:pointer_id/publish", post(publish))
        .route("/v1/pointers/:pointer_id/resolve", get(resolve))
        .layer(middleware::from_fn(user_auth_middleware));

    let app = Router::new()
        .route("/health", get(health))
        .merge(admin_routes)
        .merge(user_routes)
        .layer(cors)
        .with_state(state);

    tracing::info!(port = config.port, "starting CipherBox API");
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await.unwrap();
}
