//! TOML-based configuration system for IdMigrate.
//!
//! All sensitive values (API tokens, management keys) are stored as `_env`
//! fields that reference environment variable names. The actual secrets are
//! resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Source platform (Auth0) settings.
    pub auth0: Auth0Config,

    /// Destination platform (Descope) settings.
    pub descope: DescopeConfig,

    /// Batching and retry behaviour.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Run-log settings.
    #[serde(default)]
    pub logging: LogConfig,
}

// ---------------------------------------------------------------------------
// Auth0
// ---------------------------------------------------------------------------

/// Auth0 Management API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth0Config {
    /// Full management domain (e.g. `dev-xyz.us.auth0.com`).
    pub domain: String,

    /// Environment variable holding the Management API bearer token.
    pub token_env: String,

    /// Records requested per page (default 20).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_page_size() -> u32 {
    20
}

// ---------------------------------------------------------------------------
// Descope
// ---------------------------------------------------------------------------

/// Descope Management API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescopeConfig {
    /// Management API base URL (default `https://api.descope.com`).
    #[serde(default = "default_descope_api_url")]
    pub api_url: String,

    /// Descope project ID.
    pub project_id: String,

    /// Environment variable holding the management key.
    pub management_key_env: String,

    /// Resolved management key (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub management_key: Option<String>,
}

fn default_descope_api_url() -> String {
    "https://api.descope.com".into()
}

// ---------------------------------------------------------------------------
// Migration behaviour
// ---------------------------------------------------------------------------

/// Batching and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Records per destination batch call (default 50, must be >= 1).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per chunk before marking its records rate-limit failed
    /// (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds; attempt n waits base * 2^n,
    /// capped (default 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds (default 60000).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_batch_size() -> usize {
    50
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Run-log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory the per-run log file is written to (default `logs`).
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Minimum console level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables and populate the
    /// corresponding resolved fields.
    ///
    /// Fields that reference a missing variable will log a warning but will
    /// **not** fail -- callers can check the `Option` fields and decide what
    /// is required for their execution mode (a dry run against an export file
    /// needs neither secret).
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.auth0.token = resolve_optional_env(&self.auth0.token_env, "auth0.token_env");
        self.descope.management_key = resolve_optional_env(
            &self.descope.management_key_env,
            "descope.management_key_env",
        );

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth0.domain.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "auth0.domain".into(),
                detail: "Auth0 domain must not be empty".into(),
            });
        }
        if self.auth0.domain.contains("://") {
            return Err(ConfigError::InvalidValue {
                field: "auth0.domain".into(),
                detail: "Auth0 domain must be a bare hostname, not a URL".into(),
            });
        }
        if self.descope.project_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "descope.project_id".into(),
                detail: "Descope project ID must not be empty".into(),
            });
        }
        if self.migration.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "migration.batch_size".into(),
                detail: "batch size must be >= 1".into(),
            });
        }
        if self.migration.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "migration.max_attempts".into(),
                detail: "max attempts must be >= 1".into(),
            });
        }
        if self.auth0.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "auth0.page_size".into(),
                detail: "page size must be >= 1".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
