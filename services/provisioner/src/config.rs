//! Daemon configuration (env-driven).

use anyhow::{Context, Result};
use convoy_id::MachineId;

/// Provisioner daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment name, used in logs and instance ids.
    pub environment: String,

    /// Provider type to resolve through the registry.
    pub provider_type: String,

    /// Machine id of the authority this daemon provisions for; stamped
    /// into every nonce.
    pub authority: MachineId,

    /// Start with safe mode on: unknown instances are left alone until
    /// an operator turns the sweep back on.
    pub safe_mode: bool,

    /// Ceiling on transient-error retries per machine. Unset retries
    /// for as long as the retry watcher redelivers.
    pub retry_limit: Option<u32>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let environment =
            std::env::var("CONVOY_ENVIRONMENT").unwrap_or_else(|_| "local".to_string());

        let provider_type =
            std::env::var("CONVOY_PROVIDER").unwrap_or_else(|_| "dummy".to_string());

        let authority = std::env::var("CONVOY_AUTHORITY")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<MachineId>()
            .context("CONVOY_AUTHORITY must be a machine id, e.g. 0.")?;

        let safe_mode = std::env::var("CONVOY_SAFE_MODE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let retry_limit = std::env::var("CONVOY_RETRY_LIMIT")
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .context("CONVOY_RETRY_LIMIT must be an integer.")?;

        let log_level = std::env::var("CONVOY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            provider_type,
            authority,
            safe_mode,
            retry_limit,
            log_level,
        })
    }
}
