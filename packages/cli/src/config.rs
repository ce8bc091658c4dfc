// ABOUTME: CLI configuration resolved from flags and environment variables
// ABOUTME: Selects the provider backend and builds it ready for the orchestrator

use sandflow_config::{
    DEFAULT_DOCKER_IMAGE, SANDFLOW_DOCKER_IMAGE, SANDFLOW_DOCKER_PULL_TIMEOUT_SECS,
    SANDFLOW_PROVIDER,
};
use sandflow_sandbox::{DockerProvider, LocalProvider, Provider, ProviderError};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PULL_TIMEOUT_SECS: u64 = 600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid provider: {0} (expected 'local' or 'docker')")]
    InvalidProvider(String),
    #[error("Invalid {name}: {value}")]
    InvalidValue { name: String, value: String },
    #[error("Provider could not be created: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Docker,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "docker" => Ok(ProviderKind::Docker),
            _ => Err(ConfigError::InvalidProvider(s.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Local => f.write_str("local"),
            ProviderKind::Docker => f.write_str("docker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub provider: ProviderKind,
    pub docker_image: String,
    pub docker_pull_timeout: Duration,
}

impl CliConfig {
    /// Read the environment, then let explicit flags win
    pub fn resolve(provider: Option<&str>, image: Option<&str>) -> Result<Self, ConfigError> {
        let provider = match provider {
            Some(flag) => flag.parse()?,
            None => env::var(SANDFLOW_PROVIDER)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.parse::<ProviderKind>())
                .transpose()?
                .unwrap_or(ProviderKind::Local),
        };

        let docker_image = image
            .map(str::to_string)
            .or_else(|| env::var(SANDFLOW_DOCKER_IMAGE).ok())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DOCKER_IMAGE.to_string());

        let docker_pull_timeout = match env::var(SANDFLOW_DOCKER_PULL_TIMEOUT_SECS) {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| ConfigError::InvalidValue {
                    name: SANDFLOW_DOCKER_PULL_TIMEOUT_SECS.to_string(),
                    value: raw.clone(),
                })?,
            Err(_) => Duration::from_secs(DEFAULT_PULL_TIMEOUT_SECS),
        };

        Ok(Self {
            provider,
            docker_image,
            docker_pull_timeout,
        })
    }

    pub fn build_provider(&self) -> Result<Arc<dyn Provider>, ConfigError> {
        build_provider(self.provider, &self.docker_image, self.docker_pull_timeout)
    }
}

pub fn build_provider(
    kind: ProviderKind,
    docker_image: &str,
    pull_timeout: Duration,
) -> Result<Arc<dyn Provider>, ConfigError> {
    match kind {
        ProviderKind::Local => Ok(Arc::new(LocalProvider::new())),
        ProviderKind::Docker => Ok(Arc::new(
            DockerProvider::with_pull_timeout(pull_timeout)?.with_default_image(docker_image),
        )),
    }
}
