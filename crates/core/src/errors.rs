//! Error types for the IdMigrate core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`MigrationError`] enum unifies them all for callers that want a
//! single error type.
//!
//! The split mirrors the run-abort policy: [`SourceError::Unavailable`] is
//! fatal before any destination write has happened, while destination-side
//! failures after that point are recorded per record and never abort the run.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operator interrupted the run. The in-flight call was allowed to
    /// finish; everything attempted so far is in the report.
    #[error("migration cancelled by operator")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Source (Auth0) errors
// ---------------------------------------------------------------------------

/// Errors from the source platform (Auth0 API or export files).
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be reached or refused the request. Fatal:
    /// partial source data would make an incomplete migration undetectable.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The source rejected our credentials.
    #[error("source authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A record in an export file did not have the required shape.
    /// Skipped and counted, never fatal.
    #[error("malformed source record at line {line}: {detail}")]
    MalformedRecord {
        line: usize,
        detail: String,
    },

    /// HTTP-level transport error (network, TLS, timeout).
    #[error("source HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Generic I/O wrapper for export-file reads.
    #[error("source I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Destination (Descope) errors
// ---------------------------------------------------------------------------

/// Errors from the destination platform, surfaced to the batch dispatcher.
#[derive(Debug, Error)]
pub enum DestinationError {
    /// The destination throttled us. `retry_after` carries the server's
    /// suggested wait in seconds when the response included one.
    #[error("destination rate limit hit{}", .retry_after.map(|s| format!(" (retry after {}s)", s)).unwrap_or_default())]
    RateLimited {
        retry_after: Option<u64>,
    },

    /// The entity already exists. Carries the existing destination ID when
    /// the response included one; the dispatcher treats this as a merge.
    #[error("entity already exists at destination{}", .existing_id.as_deref().map(|id| format!(": {}", id)).unwrap_or_default())]
    Conflict {
        existing_id: Option<String>,
    },

    /// The destination rejected the payload. Fails the record, not the run.
    #[error("destination rejected record: {0}")]
    Validation(String),

    /// The destination rejected our credentials.
    #[error("destination authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The destination could not be reached or returned a server error.
    #[error("destination unavailable: {0}")]
    Unavailable(String),

    /// HTTP-level transport error (network, TLS, timeout).
    #[error("destination HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Could not decode a destination response body.
    #[error("destination response parse error: {0}")]
    ParseError(String),
}

impl DestinationError {
    /// Whether retrying the same call can possibly succeed.
    ///
    /// Only rate limits are retried; conflicts and validation failures are
    /// deterministic and would just re-fail.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

// ---------------------------------------------------------------------------
// Mapping errors
// ---------------------------------------------------------------------------

/// Errors from translating a source record into a destination payload.
#[derive(Debug, Error)]
pub enum MapError {
    /// The password hash uses an algorithm the destination cannot import.
    /// The user is still migrated, just without a password.
    #[error("unsupported password hash algorithm '{scheme}' for user '{login_id}'")]
    UnsupportedHashAlgorithm {
        login_id: String,
        scheme: String,
    },

    /// The hash string claimed a supported scheme but did not parse.
    #[error("invalid password hash for user '{login_id}': {detail}")]
    InvalidHash {
        login_id: String,
        detail: String,
    },

    /// The record has no usable login identifier at all.
    #[error("no usable login identifier for source user '{0}'")]
    NoLoginId(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing {
        var: String,
        field: String,
    },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
