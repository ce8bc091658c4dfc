// ABOUTME: Local process provider backing each execution unit with a private temp directory
// ABOUTME: Runs commands through `sh -c` via tokio::process and confines file access to the unit root

use super::{
    CommandSpec, ExecResult, Provider, ProviderCapabilities, ProviderError, ProviderInfo,
    ProviderStatus, Result, UnitConfig,
};
use async_trait::async_trait;
use sandflow_config::SANDFLOW_WORKDIR;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct LocalUnit {
    root: TempDir,
    env_vars: HashMap<String, String>,
}

/// Provider that runs units as plain processes on the host
///
/// Isolation is limited to the filesystem view: every path a stage hands
/// to `write_file`/`read_file` is resolved inside the unit's own root,
/// absolute paths included. Processes are not sandboxed further.
pub struct LocalProvider {
    units: Arc<RwLock<HashMap<String, LocalUnit>>>,
    shell: String,
    max_units: Option<usize>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self {
            units: Arc::new(RwLock::new(HashMap::new())),
            shell: "sh".to_string(),
            max_units: None,
        }
    }

    /// Refuse to create more than `max_units` live units at a time
    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = Some(max_units);
        self
    }

    /// Map a unit path into the unit root, rejecting `..` escapes
    fn resolve(root: &Path, path: &str) -> Result<PathBuf> {
        let mut resolved = root.to_path_buf();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(ProviderError::FileError(format!(
                        "Path '{}' escapes the unit root",
                        path
                    )))
                }
            }
        }
        Ok(resolved)
    }

    async fn unit_root(&self, handle: &str) -> Result<(PathBuf, HashMap<String, String>)> {
        let units = self.units.read().await;
        let unit = units
            .get(handle)
            .ok_or_else(|| ProviderError::UnitNotFound(handle.to_string()))?;
        Ok((unit.root.path().to_path_buf(), unit.env_vars.clone()))
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            file_transfer: true,
            network_exposure: false,
        }
    }

    async fn is_available(&self) -> Result<bool> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg("true")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        Ok(matches!(status, Ok(s) if s.success()))
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let status = if self.is_available().await? {
            ProviderStatus::Ready
        } else {
            ProviderStatus::NotAvailable(format!("Shell '{}' not runnable", self.shell))
        };

        Ok(ProviderInfo {
            name: "Local".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            provider_type: "local".to_string(),
            capabilities: self.capabilities(),
            status,
        })
    }

    async fn create(&self, config: &UnitConfig) -> Result<String> {
        if config.requires_network() {
            return Err(ProviderError::NotSupported(
                "Local units cannot expose ports".to_string(),
            ));
        }

        let mut units = self.units.write().await;
        if let Some(max) = self.max_units {
            if units.len() >= max {
                return Err(ProviderError::CapacityExhausted(format!(
                    "Maximum local units ({}) reached",
                    max
                )));
            }
        }

        let root = tempfile::Builder::new()
            .prefix(&format!("{}-", config.name_prefix))
            .tempdir()
            .map_err(|e| ProviderError::ProvisionError(e.to_string()))?;

        let handle = uuid::Uuid::new_v4().to_string();
        info!("Created local unit {} at {}", handle, root.path().display());

        units.insert(
            handle.clone(),
            LocalUnit {
                root,
                env_vars: config.env_vars.clone(),
            },
        );

        Ok(handle)
    }

    async fn run(&self, handle: &str, command: &CommandSpec) -> Result<ExecResult> {
        let (root, unit_env) = self.unit_root(handle).await?;
        debug!("Executing command in local unit {}: {}", handle, command.command);

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&command.command)
            .current_dir(&root)
            .envs(&unit_env)
            .envs(&command.env_vars)
            .env(SANDFLOW_WORKDIR, &root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        Ok(ExecResult {
            // Killed by signal reports no code
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn write_file(&self, handle: &str, path: &str, contents: &[u8]) -> Result<()> {
        let (root, _) = self.unit_root(handle).await?;
        let target = Self::resolve(&root, path)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::FileError(format!("{}: {}", path, e)))?;
        }

        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| ProviderError::FileError(format!("{}: {}", path, e)))
    }

    async fn read_file(&self, handle: &str, path: &str) -> Result<Vec<u8>> {
        let (root, _) = self.unit_root(handle).await?;
        let target = Self::resolve(&root, path)?;

        tokio::fs::read(&target)
            .await
            .map_err(|e| ProviderError::FileError(format!("{}: {}", path, e)))
    }

    async fn remove_file(&self, handle: &str, path: &str) -> Result<()> {
        let (root, _) = self.unit_root(handle).await?;
        let target = Self::resolve(&root, path)?;

        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::FileError(format!("{}: {}", path, e))),
        }
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        let removed = self.units.write().await.remove(handle);
        match removed {
            Some(unit) => {
                info!("Removing local unit {}", handle);
                unit.root
                    .close()
                    .map_err(|e| ProviderError::InternalError(e.to_string()))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resolve_reroots_absolute_paths() {
        let root = Path::new("/tmp/unit-root");
        assert_eq!(
            LocalProvider::resolve(root, "/home/user/input.json").unwrap(),
            PathBuf::from("/tmp/unit-root/home/user/input.json")
        );
        assert_eq!(
            LocalProvider::resolve(root, "input.json").unwrap(),
            PathBuf::from("/tmp/unit-root/input.json")
        );
    }

    #[test]
    fn test_resolve_rejects_parent_escape() {
        let root = Path::new("/tmp/unit-root");
        assert!(LocalProvider::resolve(root, "../other/input.json").is_err());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let provider = LocalProvider::new().with_max_units(1);
        let first = provider.create(&UnitConfig::default()).await.unwrap();

        let second = provider.create(&UnitConfig::default()).await;
        assert!(matches!(second, Err(ProviderError::CapacityExhausted(_))));

        provider.destroy(&first).await.unwrap();
        let third = provider.create(&UnitConfig::default()).await.unwrap();
        provider.destroy(&third).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_file_tolerates_missing_files() {
        let provider = LocalProvider::new();
        let handle = provider.create(&UnitConfig::default()).await.unwrap();

        provider.write_file(&handle, "out.json", b"{}").await.unwrap();
        provider.remove_file(&handle, "out.json").await.unwrap();
        assert!(provider.read_file(&handle, "out.json").await.is_err());
        provider.remove_file(&handle, "out.json").await.unwrap();

        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_sees_written_files() {
        let provider = LocalProvider::new();
        let handle = provider.create(&UnitConfig::default()).await.unwrap();

        provider
            .write_file(&handle, "/data/input.json", b"{\"n\": 3}")
            .await
            .unwrap();

        let result = provider
            .run(
                &handle,
                &CommandSpec::new("cat data/input.json", Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout_lossy(), "{\"n\": 3}");

        provider.destroy(&handle).await.unwrap();
        // Second destroy is a no-op
        provider.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_units_do_not_share_files() {
        let provider = LocalProvider::new();
        let a = provider.create(&UnitConfig::default()).await.unwrap();
        let b = provider.create(&UnitConfig::default()).await.unwrap();

        provider.write_file(&a, "secret.txt", b"a").await.unwrap();
        assert!(provider.read_file(&b, "secret.txt").await.is_err());

        provider.destroy(&a).await.unwrap();
        provider.destroy(&b).await.unwrap();
    }
}
