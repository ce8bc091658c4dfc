// ABOUTME: Orchestrator settings loaded from environment variables with validated defaults
// ABOUTME: Covers stage timeout, workflow deadline, concurrency budget, and teardown bounds

use sandflow_config::{
    DEFAULT_INPUT_PATH, DEFAULT_MAX_CONCURRENCY, DEFAULT_STAGE_TIMEOUT_SECS,
    DEFAULT_TEARDOWN_TIMEOUT_SECS, SANDFLOW_INPUT_PATH, SANDFLOW_MAX_CONCURRENCY,
    SANDFLOW_STAGE_TIMEOUT_SECS, SANDFLOW_STRICT_PARALLELISM, SANDFLOW_TEARDOWN_TIMEOUT_SECS,
    SANDFLOW_WORKFLOW_DEADLINE_SECS,
};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the concurrency budget
pub const MAX_CONCURRENCY_LIMIT: usize = 256;

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("Invalid value for {name}: '{value}' ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Default per-stage timeout; stages may override it
    pub stage_timeout: Duration,
    /// Whole-workflow deadline, if any
    pub workflow_deadline: Option<Duration>,
    /// Maximum units driven concurrently by one workflow
    pub max_concurrency: usize,
    /// Fail with InsufficientCapacity instead of degrading to a smaller pool
    pub strict_parallelism: bool,
    /// Path inside each unit where the input payload is written
    pub input_path: String,
    /// Bound on each unit release during teardown
    pub teardown_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
            workflow_deadline: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            strict_parallelism: false,
            input_path: DEFAULT_INPUT_PATH.to_string(),
            teardown_timeout: Duration::from_secs(DEFAULT_TEARDOWN_TIMEOUT_SECS),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let stage_timeout = match read_u64(SANDFLOW_STAGE_TIMEOUT_SECS)? {
            Some(secs) => Duration::from_secs(require_positive(SANDFLOW_STAGE_TIMEOUT_SECS, secs)?),
            None => defaults.stage_timeout,
        };

        let workflow_deadline = read_u64(SANDFLOW_WORKFLOW_DEADLINE_SECS)?
            .map(|secs| require_positive(SANDFLOW_WORKFLOW_DEADLINE_SECS, secs))
            .transpose()?
            .map(Duration::from_secs);

        let max_concurrency = match read_u64(SANDFLOW_MAX_CONCURRENCY)? {
            Some(value) => {
                if value == 0 || value > MAX_CONCURRENCY_LIMIT as u64 {
                    return Err(SettingsError::OutOfRange {
                        name: SANDFLOW_MAX_CONCURRENCY,
                        value,
                        min: 1,
                        max: MAX_CONCURRENCY_LIMIT as u64,
                    });
                }
                value as usize
            }
            None => defaults.max_concurrency,
        };

        let strict_parallelism = match env::var(SANDFLOW_STRICT_PARALLELISM) {
            Ok(raw) => parse_bool(SANDFLOW_STRICT_PARALLELISM, &raw)?,
            Err(_) => defaults.strict_parallelism,
        };

        let input_path = match env::var(SANDFLOW_INPUT_PATH) {
            Ok(path) if path.trim().is_empty() => {
                return Err(SettingsError::InvalidValue {
                    name: SANDFLOW_INPUT_PATH,
                    value: path,
                    reason: "path must not be empty".to_string(),
                })
            }
            Ok(path) => path.trim().to_string(),
            Err(_) => defaults.input_path,
        };

        let teardown_timeout = match read_u64(SANDFLOW_TEARDOWN_TIMEOUT_SECS)? {
            Some(secs) => Duration::from_secs(require_positive(
                SANDFLOW_TEARDOWN_TIMEOUT_SECS,
                secs,
            )?),
            None => defaults.teardown_timeout,
        };

        Ok(Self {
            stage_timeout,
            workflow_deadline,
            max_concurrency,
            strict_parallelism,
            input_path,
            teardown_timeout,
        })
    }
}

fn read_u64(name: &'static str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| SettingsError::InvalidValue {
                name,
                value: raw,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn require_positive(name: &'static str, value: u64) -> Result<u64> {
    if value == 0 {
        return Err(SettingsError::OutOfRange {
            name,
            value,
            min: 1,
            max: u64::MAX,
        });
    }
    Ok(value)
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
