//! Core entities: `User`, `Vault`, `FolderPointer`, the encrypted
//! folder-metadata schema, `RepublishSchedule`, `TeeEpochState`, and
//! `EpochRotationLog`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A stable, opaque user identifier issued by the (out-of-scope) auth
/// collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mutable pointer's identifier — the base36 CIDv1 hash of its
/// Ed25519 signing public key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointerId(String);

impl PointerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user, bound to exactly one secp256k1 wrapping public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    /// Uncompressed 65-byte secp256k1 public key.
    pub public_key: Vec<u8>,
    pub derivation_version: u32,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// One per user: the wrapped root key and the root pointer it anchors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vault {
    pub user_id: UserId,
    /// ECIES ciphertext of the root-folder key under the user's public key.
    pub wrapped_root_key: Vec<u8>,
    pub root_pointer_id: PointerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FolderPointer
// ---------------------------------------------------------------------------

/// What kind of mutable-pointer record a `FolderPointer` row tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Root,
    Folder,
}

/// `(user_id, pointer_id) -> ...`. `sequence_number` is monotonically
/// nondecreasing across all publishes (client and republisher combined).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderPointer {
    pub user_id: UserId,
    pub pointer_id: PointerId,
    pub latest_content_id: String,
    pub sequence_number: u64,
    /// Present only once the client has opted this pointer into
    /// republishing by supplying both fields on a publish.
    pub wrapped_signing_key: Option<String>,
    pub key_epoch: Option<u32>,
    pub is_root: bool,
    pub record_type: RecordType,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Encrypted folder metadata (the payload at a FolderPointer's content ID)
// ---------------------------------------------------------------------------

/// A file entry in a folder's child list.
///
/// `name_ciphertext`/`name_iv` are sealed under the *parent* folder's
/// symmetric key, so listing a folder only requires that folder's key.
/// `wrapped_file_key` is sealed under the user's public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name_ciphertext: String,
    pub name_iv: String,
    pub content_id: String,
    pub wrapped_file_key: String,
    pub file_iv: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A sub-folder entry in a folder's child list.
///
/// `wrapped_folder_key` lets the user materialize the child folder's AEAD
/// key; `wrapped_child_signing_key` independently wraps the child
/// pointer's Ed25519 signing seed. Both sealed under the user's public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubFolderEntry {
    pub name_ciphertext: String,
    pub name_iv: String,
    pub child_pointer_id: PointerId,
    pub wrapped_folder_key: String,
    pub wrapped_child_signing_key: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A child of a folder: either a file or a sub-folder.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FolderChild {
    File(FileEntry),
    Folder(SubFolderEntry),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderTimestamps {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// The logical schema encrypted as a single AEAD blob under a folder's
/// symmetric key; this is the plaintext form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderMetadata {
    pub children: Vec<FolderChild>,
    pub metadata: FolderTimestamps,
}

impl FolderMetadata {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            children: Vec::new(),
            metadata: FolderTimestamps { created: now, modified: now },
        }
    }
}

// ---------------------------------------------------------------------------
// RepublishSchedule
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Failed,
    Stale,
}

/// `(pointer_id) -> ...`, created when a pointer first publishes with a
/// wrapped signing key; updated after every republish attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepublishSchedule {
    pub pointer_id: PointerId,
    pub user_id: UserId,
    pub status: ScheduleStatus,
    pub wrapped_signing_key: String,
    pub key_epoch: u32,
    pub last_content_id: String,
    pub last_sequence_number: u64,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// TeeEpochState / EpochRotationLog
// ---------------------------------------------------------------------------

/// Singleton: the signer's current and (during the grace window) previous
/// derivation epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TeeEpochState {
    pub current_epoch: u32,
    pub current_public_key: Vec<u8>,
    pub previous_epoch: Option<u32>,
    pub previous_public_key: Option<Vec<u8>>,
    pub previous_deprecation_at: Option<DateTime<Utc>>,
}

/// An append-only audit row for one epoch rotation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochRotationLog {
    pub id: u64,
    pub from_epoch: u32,
    pub to_epoch: u32,
    pub from_public_key: Vec<u8>,
    pub to_public_key: Vec<u8>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RequestContext — threaded through every core operation for logging
// ---------------------------------------------------------------------------

/// Carries the fields every structured log line needs: what operation is
/// running, for which user, and when it started (for `duration_ms`).
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub operation: &'static str,
    pub user_id: Option<UserId>,
    pub pointer_id: Option<PointerId>,
    pub started_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(operation: &'static str) -> Self {
        Self { operation, user_id: None, pointer_id: None, started_at: Utc::now() }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_pointer(mut self, pointer_id: PointerId) -> Self {
        self.pointer_id = Some(pointer_id);
        self
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}
