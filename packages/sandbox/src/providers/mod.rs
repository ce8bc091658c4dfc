// ABOUTME: Provider trait and implementations for isolated execution backends
// ABOUTME: Defines the narrow create/run/write/read/destroy capability surface the engine consumes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod docker;
pub mod local;

pub use docker::DockerProvider;
pub use local::LocalProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Provisioning error: {0}")]
    ProvisionError(String),

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("File error: {0}")]
    FileError(String),

    #[error("Exec error: {0}")]
    ExecError(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Configuration for provisioning one execution unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Image or template the provider should boot (ignored by providers without images)
    pub image: Option<String>,
    /// Human readable prefix used when naming the remote resource
    pub name_prefix: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Ports the unit must expose (network exposure capability profile)
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    /// Expected lifetime hint, used by providers that bill or reap by age
    pub expected_lifetime_secs: Option<u64>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            image: None,
            name_prefix: "sandflow-unit".to_string(),
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            exposed_ports: Vec::new(),
            expected_lifetime_secs: None,
        }
    }
}

impl UnitConfig {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn requires_network(&self) -> bool {
        !self.exposed_ports.is_empty()
    }
}

/// A single command invocation inside a unit
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Shell command line, interpreted by `sh -c`
    pub command: String,
    pub env_vars: HashMap<String, String>,
    /// Upper bound the provider may use to kill the process early
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            env_vars: HashMap::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }
}

/// Execution result from running a command in a unit
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Supports write_file/read_file
    pub file_transfer: bool,
    /// Can expose unit ports to the host network
    pub network_exposure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Ready,
    NotAvailable(String),
    Degraded(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub version: String,
    pub provider_type: String,
    pub capabilities: ProviderCapabilities,
    pub status: ProviderStatus,
}

/// Provider trait for isolated execution backends
///
/// Every method is a fallible remote call. Only `destroy` is assumed
/// idempotent: destroying an already-destroyed handle must succeed.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static capability profile of units created by this provider
    fn capabilities(&self) -> ProviderCapabilities;

    /// Check if the provider is available and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Get provider information and capabilities
    async fn info(&self) -> Result<ProviderInfo>;

    /// Allocate a new unit and return its opaque handle
    async fn create(&self, config: &UnitConfig) -> Result<String>;

    /// Run a command inside the unit and collect its output
    async fn run(&self, handle: &str, command: &CommandSpec) -> Result<ExecResult>;

    /// Write a file inside the unit, creating parent directories
    async fn write_file(&self, handle: &str, path: &str, contents: &[u8]) -> Result<()>;

    /// Read a file from inside the unit
    async fn read_file(&self, handle: &str, path: &str) -> Result<Vec<u8>>;

    /// Remove a file inside the unit; a missing file is not an error
    async fn remove_file(&self, handle: &str, path: &str) -> Result<()>;

    /// Reclaim the unit
    async fn destroy(&self, handle: &str) -> Result<()>;
}
