// ABOUTME: Execution unit handle wrapping one provisioned isolated environment
// ABOUTME: Tracks liveness state and exposes inject/extract/execute/release with exclusive access

use crate::providers::{CommandSpec, ExecResult, Provider, ProviderCapabilities, ProviderError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error("Provision error: {0}")]
    Provision(#[source] ProviderError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: ProviderError,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Exec error: {0}")]
    Exec(#[source] ProviderError),

    #[error("Unit {id} is not usable in state {state}")]
    NotUsable { id: Uuid, state: UnitState },

    #[error("Teardown error: {0}")]
    Teardown(#[source] ProviderError),
}

pub type Result<T> = std::result::Result<T, UnitError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Provisioning,
    Ready,
    Busy,
    Terminated,
    Failed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Provisioning => "provisioning",
            UnitState::Ready => "ready",
            UnitState::Busy => "busy",
            UnitState::Terminated => "terminated",
            UnitState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One allocated isolated environment
///
/// All operations take `&mut self`: a unit can only be driven by one
/// stage at a time. Dropping a unit that was never released schedules
/// a best-effort destroy on the current tokio runtime.
pub struct ExecutionUnit {
    id: Uuid,
    handle: String,
    created_at: DateTime<Utc>,
    state: UnitState,
    capabilities: ProviderCapabilities,
    provider: Arc<dyn Provider>,
    live_units: Arc<AtomicUsize>,
    reclaimed: bool,
}

impl fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("created_at", &self.created_at)
            .field("state", &self.state)
            .finish()
    }
}

impl ExecutionUnit {
    pub(crate) fn new(
        handle: String,
        provider: Arc<dyn Provider>,
        live_units: Arc<AtomicUsize>,
    ) -> Self {
        let capabilities = provider.capabilities();
        Self {
            id: Uuid::new_v4(),
            handle,
            created_at: Utc::now(),
            state: UnitState::Ready,
            capabilities,
            provider,
            live_units,
            reclaimed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Provider-side handle (container id, directory key, ...)
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    /// Ready or Busy; Failed and Terminated units must not run more work
    pub fn is_usable(&self) -> bool {
        matches!(self.state, UnitState::Ready | UnitState::Busy)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(UnitError::NotUsable {
                id: self.id,
                state: self.state,
            })
        }
    }

    /// Mark the unit as unrecoverable; it stays tracked until released
    pub fn mark_failed(&mut self) {
        if self.state != UnitState::Terminated {
            warn!(unit_id = %self.id, "Marking execution unit as failed");
            self.state = UnitState::Failed;
        }
    }

    /// Write `bytes` to `path` inside the unit
    pub async fn inject(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        debug!(unit_id = %self.id, path, bytes = bytes.len(), "Injecting file");
        self.provider
            .write_file(&self.handle, path, bytes)
            .await
            .map_err(|source| UnitError::Io {
                path: path.to_string(),
                source,
            })
    }

    /// Read `path` from inside the unit
    pub async fn extract(&mut self, path: &str) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        debug!(unit_id = %self.id, path, "Extracting file");
        self.provider
            .read_file(&self.handle, path)
            .await
            .map_err(|source| UnitError::Io {
                path: path.to_string(),
                source,
            })
    }

    /// Delete `path` inside the unit if it exists
    pub async fn remove(&mut self, path: &str) -> Result<()> {
        self.ensure_usable()?;
        debug!(unit_id = %self.id, path, "Removing file");
        self.provider
            .remove_file(&self.handle, path)
            .await
            .map_err(|source| UnitError::Io {
                path: path.to_string(),
                source,
            })
    }

    /// Run a command with a hard timeout
    ///
    /// A timeout or a provider-level exec failure leaves the unit in
    /// `Failed`; a non-zero exit code is a normal result.
    pub async fn execute(&mut self, command: &CommandSpec) -> Result<ExecResult> {
        self.ensure_usable()?;
        self.state = UnitState::Busy;

        let outcome =
            tokio::time::timeout(command.timeout, self.provider.run(&self.handle, command)).await;

        match outcome {
            Ok(Ok(result)) => {
                self.state = UnitState::Ready;
                debug!(unit_id = %self.id, exit_code = result.exit_code, "Command finished");
                Ok(result)
            }
            Ok(Err(e)) => {
                self.state = UnitState::Failed;
                Err(UnitError::Exec(e))
            }
            Err(_) => {
                self.state = UnitState::Failed;
                warn!(unit_id = %self.id, timeout = ?command.timeout, "Command timed out");
                Err(UnitError::Timeout(command.timeout))
            }
        }
    }

    /// Destroy the remote resource
    ///
    /// Idempotent. The unit counts as reclaimed even when the provider
    /// reports an error, so a failed teardown is surfaced exactly once and
    /// never double-decrements the live unit count.
    pub async fn release(&mut self) -> Result<()> {
        if self.reclaimed {
            return Ok(());
        }
        self.reclaimed = true;
        self.state = UnitState::Terminated;
        self.live_units.fetch_sub(1, Ordering::SeqCst);

        info!(unit_id = %self.id, handle = %self.handle, "Releasing execution unit");
        self.provider
            .destroy(&self.handle)
            .await
            .map_err(UnitError::Teardown)
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        if self.reclaimed {
            return;
        }
        self.reclaimed = true;
        self.live_units.fetch_sub(1, Ordering::SeqCst);

        warn!(unit_id = %self.id, handle = %self.handle, "Execution unit dropped without release");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let provider = self.provider.clone();
            let handle = self.handle.clone();
            runtime.spawn(async move {
                if let Err(e) = provider.destroy(&handle).await {
                    warn!(handle = %handle, "Background destroy failed: {}", e);
                }
            });
        }
    }
}
