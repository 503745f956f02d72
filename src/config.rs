//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_DB_PATH: &str = "./data/freight-automation.db";
const DEFAULT_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_BACKLOG_LIMIT: usize = 500;

/// Runtime settings for the automation service.
#[derive(Debug, Clone)]
pub struct AutomationSettings {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Time between dispatch passes.
    pub interval: Duration,
    /// Messages processed concurrently within one config.
    pub max_concurrent_messages: usize,
    /// Maximum unprocessed messages loaded per config per pass.
    pub backlog_limit: usize,
    /// Directory for rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS), // 5 minutes
            max_concurrent_messages: DEFAULT_MAX_CONCURRENT,
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            log_dir: None,
        }
    }
}

impl AutomationSettings {
    /// Build settings from `FREIGHT_AUTOMATION_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("FREIGHT_AUTOMATION_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let interval_secs = parse_positive(
            &lookup,
            "FREIGHT_AUTOMATION_INTERVAL_SECS",
            DEFAULT_INTERVAL_SECS,
        )?;
        let max_concurrent_messages = parse_positive(
            &lookup,
            "FREIGHT_AUTOMATION_MAX_CONCURRENT",
            DEFAULT_MAX_CONCURRENT as u64,
        )? as usize;
        let backlog_limit = parse_positive(
            &lookup,
            "FREIGHT_AUTOMATION_BACKLOG_LIMIT",
            DEFAULT_BACKLOG_LIMIT as u64,
        )? as usize;

        let log_dir = lookup("FREIGHT_AUTOMATION_LOG_DIR")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path,
            interval: Duration::from_secs(interval_secs),
            max_concurrent_messages,
            backlog_limit,
            log_dir,
        })
    }
}

fn parse_positive<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' is not a number: {e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
