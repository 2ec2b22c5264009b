//! Environment-variable configuration, read once at process startup.
//!
//! Grounded on `citadel-api/src/main.rs`'s `CITADEL_*` env var bootstrap
//! (`std::env::var(...).ok().and_then(|v| v.parse().ok()).unwrap_or(...)`
//! per field, no config file format, no layered precedence) — the same
//! convention, renamed to `CIPHERBOX_*` and extended with the fields
//! both binaries in this workspace need.
//!
//!   CIPHERBOX_PORT                    - Listen port (default: 8080)
//!   CIPHERBOX_DATABASE_URL            - Postgres connection string
//!   CIPHERBOX_CONTENT_NETWORK_URL     - Base URL of the content network
//!   CIPHERBOX_SIGNER_URL              - Base URL of the TEE signer worker
//!   CIPHERBOX_SIGNER_BEARER_SECRET    - Bearer secret shared with the signer
//!   CIPHERBOX_ADMIN_BEARER_SECRET     - Bearer secret for the admin health endpoint
//!   CIPHERBOX_REPUBLISH_CRON          - Cron expression for the republish tick
//!   CIPHERBOX_GRACE_WINDOW_DAYS       - Epoch grace window, in days
//!   CIPHERBOX_PUBLISH_RATE_PER_MIN    - Publish rate gate, requests/min/user
//!   CIPHERBOX_LOG_FORMAT              - "json" for structured logging, "pretty" for dev

use std::time::Duration;

use crate::error::CoreError;

/// All operational parameters, sourced from `CIPHERBOX_*` environment
/// variables at startup. Both `cipherbox-api` and `cipherbox-signer`
/// load their own subset; unused fields for a given binary are simply
/// not read from the resulting struct.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub content_network_url: String,
    pub signer_url: String,
    pub signer_bearer_secret: String,
    pub admin_bearer_secret: String,
    pub republish_cron: String,
    pub grace_window: Duration,
    pub publish_rate_per_min: u32,
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Read configuration from the process environment. Fails fatally
    /// (§7 `Fatal`) rather than falling back for the fields that have no
    /// safe default in production: `database_url`, `signer_url`, and
    /// `signer_bearer_secret`.
    pub fn from_env() -> Result<Self, CoreError> {
        let database_url = require_env("CIPHERBOX_DATABASE_URL")?;
        let signer_url = require_env("CIPHERBOX_SIGNER_URL")?;
        let signer_bearer_secret = require_env("CIPHERBOX_SIGNER_BEARER_SECRET")?;
        let admin_bearer_secret = require_env("CIPHERBOX_ADMIN_BEARER_SECRET")?;

        Ok(Self {
            port: env_parsed("CIPHERBOX_PORT").unwrap_or(8080),
            database_url,
            content_network_url: std::env::var("CIPHERBOX_CONTENT_NETWORK_URL")
                .unwrap_or_else(|_| "https://ipfs.io".to_string()),
            signer_url,
            signer_bearer_secret,
            admin_bearer_secret,
            republish_cron: std::env::var("CIPHERBOX_REPUBLISH_CRON").unwrap_or_else(|_| "0 */6 * * *".to_string()),
            grace_window: Duration::from_secs(env_parsed::<u64>("CIPHERBOX_GRACE_WINDOW_DAYS").unwrap_or(28) * 86_400),
            publish_rate_per_min: env_parsed("CIPHERBOX_PUBLISH_RATE_PER_MIN").unwrap_or(10),
            log_format: match std::env::var("CIPHERBOX_LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn require_env(name: &str) -> Result<String, CoreError> {
    std::env::var(name).map_err(|_| CoreError::Fatal(format!("missing required environment variable {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_defaults_to_pretty() {
        std::env::remove_var("CIPHERBOX_LOG_FORMAT");
        assert_eq!(
            match std::env::var("CIPHERBOX_LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            LogFormat::Pretty
        );
    }

    #[test]
    fn require_env_reports_fatal_on_absence() {
        std::env::remove_var("CIPHERBOX_DOES_NOT_EXIST_IN_TESTS");
        let err = require_env("CIPHERBOX_DOES_NOT_EXIST_IN_TESTS").unwrap_err();
        assert!(matches!(err, CoreError::Fatal(_)));
    }
}
