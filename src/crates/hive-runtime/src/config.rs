//! Environment-driven runtime configuration.
//!
//! | Variable | Purpose | Default |
//! |---|---|---|
//! | `HIVE_CREDENTIAL_KEY` | Symmetric key for the credential store | required in production |
//! | `HIVE_CHECKPOINT_ROOT` | Filesystem root for checkpoints | `.hive/checkpoints` |
//! | `HIVE_MAX_STREAM_CONCURRENCY` | Upper bound on executions per stream | 16 |
//! | `HIVE_LLM_TIMEOUT_MS` | Default LLM call deadline | 120000 |
//! | `HIVE_TOOL_TIMEOUT_MS` | Default tool call deadline | 30000 |

use crate::error::{Result, RuntimeError};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const ENV_CREDENTIAL_KEY: &str = "HIVE_CREDENTIAL_KEY";
pub const ENV_CHECKPOINT_ROOT: &str = "HIVE_CHECKPOINT_ROOT";
pub const ENV_MAX_STREAM_CONCURRENCY: &str = "HIVE_MAX_STREAM_CONCURRENCY";
pub const ENV_LLM_TIMEOUT_MS: &str = "HIVE_LLM_TIMEOUT_MS";
pub const ENV_TOOL_TIMEOUT_MS: &str = "HIVE_TOOL_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub credential_key: Option<String>,
    pub checkpoint_root: PathBuf,
    /// Hard ceiling on any stream's `max_concurrency`.
    pub max_stream_concurrency: usize,
    pub llm_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            credential_key: None,
            checkpoint_root: PathBuf::from(".hive/checkpoints"),
            max_stream_concurrency: 16,
            llm_timeout: Duration::from_millis(120_000),
            tool_timeout: Duration::from_millis(30_000),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from `HIVE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(key) = std::env::var(ENV_CREDENTIAL_KEY) {
            if !key.is_empty() {
                config.credential_key = Some(key);
            }
        }
        if let Ok(root) = std::env::var(ENV_CHECKPOINT_ROOT) {
            if !root.is_empty() {
                config.checkpoint_root = PathBuf::from(root);
            }
        }
        config.max_stream_concurrency =
            parse_env(ENV_MAX_STREAM_CONCURRENCY, config.max_stream_concurrency)?;
        config.llm_timeout = Duration::from_millis(parse_env(
            ENV_LLM_TIMEOUT_MS,
            config.llm_timeout.as_millis() as u64,
        )?);
        config.tool_timeout = Duration::from_millis(parse_env(
            ENV_TOOL_TIMEOUT_MS,
            config.tool_timeout.as_millis() as u64,
        )?);
        debug!(
            checkpoint_root = %config.checkpoint_root.display(),
            max_stream_concurrency = config.max_stream_concurrency,
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Validate the configuration. `production` requires the credential
    /// key to be set.
    pub fn validate(&self, production: bool) -> Result<()> {
        if self.max_stream_concurrency == 0 {
            return Err(RuntimeError::Configuration(format!(
                "{ENV_MAX_STREAM_CONCURRENCY} must be at least 1"
            )));
        }
        if self.llm_timeout.is_zero() || self.tool_timeout.is_zero() {
            return Err(RuntimeError::Configuration(
                "call timeouts must be non-zero".to_string(),
            ));
        }
        if production && self.credential_key.is_none() {
            return Err(RuntimeError::Configuration(format!(
                "{ENV_CREDENTIAL_KEY} is required in production; set it to the credential store key"
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|_| {
            RuntimeError::Configuration(format!("{name} has invalid value '{raw}'"))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_stream_concurrency, 16);
        assert_eq!(config.llm_timeout, Duration::from_millis(120_000));
        assert_eq!(config.tool_timeout, Duration::from_millis(30_000));
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_production_requires_credential_key() {
        let config = RuntimeConfig::default();
        let err = config.validate(true).unwrap_err();
        assert!(err.to_string().contains(ENV_CREDENTIAL_KEY));

        let config = RuntimeConfig {
            credential_key: Some("k".into()),
            ..Default::default()
        };
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = RuntimeConfig {
            max_stream_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate(false).is_err());
    }
}
