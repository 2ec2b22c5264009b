//! Structured logging wrapper.
//!
//! Every event carries `timestamp, level, operation, pointer_id?,
//! user_id?, duration_ms?, error?` (§4.8). Grounded on the teacher's
//! `citadel-keystore/src/audit.rs` `AuditEvent`/`TracingAuditSink` shape,
//! narrowed from a generic audit-event log to request-scoped operation
//! logging via [`tracing`] directly (no separate sink trait is needed
//! here since every operation already emits through `tracing` and the
//! teacher's own API binary reads `tracing` output, not a bespoke sink).
//!
//! Nothing in this module ever receives key material or wrapped
//! ciphertext — only the request-context fields and short tags.

use crate::types::RequestContext;

/// Log the successful completion of an operation tracked by `ctx`.
pub fn log_success(ctx: &RequestContext) {
    tracing::info!(
        operation = ctx.operation,
        user_id = ctx.user_id.as_ref().map(|u| u.as_str()),
        pointer_id = ctx.pointer_id.as_ref().map(|p| p.as_str()),
        duration_ms = ctx.elapsed_ms(),
        "operation completed"
    );
}

/// Log a failed operation. `error` must be a short, client-safe tag
/// (e.g. `"RateLimited"`), never the internal error's `Display`, which
/// may embed request content.
pub fn log_failure(ctx: &RequestContext, error: &str) {
    tracing::warn!(
        operation = ctx.operation,
        user_id = ctx.user_id.as_ref().map(|u| u.as_str()),
        pointer_id = ctx.pointer_id.as_ref().map(|p| p.as_str()),
        duration_ms = ctx.elapsed_ms(),
        error = error,
        "operation failed"
    );
}
