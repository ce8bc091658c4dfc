// ABOUTME: Docker provider implementation for container-backed execution units
// ABOUTME: Uses bollard to create containers, exec commands and move files through tar archives

use super::{
    CommandSpec, ExecResult, Provider, ProviderCapabilities, ProviderError, ProviderInfo,
    ProviderStatus, Result, UnitConfig,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use sandflow_config::{DEFAULT_DOCKER_IMAGE, DEFAULT_UNIT_WORKDIR};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    default_image: String,
    /// Cache of successfully pulled images to avoid redundant pulls
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Create a new Docker provider with default timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    /// Create a new Docker provider with custom pull timeout
    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(format!("Docker: {}", e)))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    /// Create with a specific Docker connection and custom timeout
    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            label_prefix: "sandflow.unit".to_string(),
            default_image: DEFAULT_DOCKER_IMAGE.to_string(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }

    /// Image used when a unit config does not name one
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    /// Convert a unit config to a bollard container config
    fn to_bollard_config(&self, config: &UnitConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        labels.insert(
            format!("{}.prefix", self.label_prefix),
            config.name_prefix.clone(),
        );

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for port in &config.exposed_ports {
            let container_port = format!("{}/tcp", port);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            // Let Docker pick the host port
            let binding = vec![bollard::models::PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }];
            port_bindings.insert(container_port, Some(binding));
        }

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        Config {
            image: Some(
                config
                    .image
                    .clone()
                    .unwrap_or_else(|| self.default_image.clone()),
            ),
            // Keep the container alive; work arrives through exec
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            working_dir: Some(DEFAULT_UNIT_WORKDIR.to_string()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Resolve a unit path against the default working directory
    fn resolve_path(path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", DEFAULT_UNIT_WORKDIR, path)
        }
    }

    async fn exec_raw(
        &self,
        handle: &str,
        cmd: Vec<String>,
        env_vars: &HashMap<String, String>,
    ) -> Result<ExecResult> {
        let env: Vec<String> = env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(env),
            working_dir: Some(DEFAULT_UNIT_WORKDIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(handle, exec_config)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(ProviderError::ExecError(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::ExecError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        Ok(ExecResult {
            exit_code: exit_status(exec_inspect.exit_code),
            stdout,
            stderr,
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }

        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            file_transfer: true,
            network_exposure: true,
        }
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let version = self
            .client
            .version()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        let status = if self.is_available().await? {
            ProviderStatus::Ready
        } else {
            ProviderStatus::NotAvailable("Docker daemon not responding".to_string())
        };

        Ok(ProviderInfo {
            name: "Docker".to_string(),
            version: version.version.unwrap_or_else(|| "unknown".to_string()),
            provider_type: "docker".to_string(),
            capabilities: self.capabilities(),
            status,
        })
    }

    async fn create(&self, config: &UnitConfig) -> Result<String> {
        let image = config
            .image
            .clone()
            .unwrap_or_else(|| self.default_image.clone());

        if !self.image_exists(&image).await? {
            self.pull_image(&image).await?;
        }

        let name = format!(
            "{}-{}",
            config.name_prefix,
            uuid::Uuid::new_v4().simple()
        );
        info!("Creating container: {}", name);

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(config))
            .await
            .map_err(|e| ProviderError::ProvisionError(e.to_string()))?;

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Do not leak a created-but-unstarted container
            let _ = self.destroy(&container.id).await;
            return Err(ProviderError::ProvisionError(e.to_string()));
        }

        let mkdir = self
            .exec_raw(
                &container.id,
                vec![
                    "mkdir".to_string(),
                    "-p".to_string(),
                    DEFAULT_UNIT_WORKDIR.to_string(),
                ],
                &HashMap::new(),
            )
            .await?;
        if !mkdir.success() {
            let _ = self.destroy(&container.id).await;
            return Err(ProviderError::ProvisionError(format!(
                "Failed to prepare working directory: {}",
                mkdir.stderr_lossy()
            )));
        }

        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn run(&self, handle: &str, command: &CommandSpec) -> Result<ExecResult> {
        info!("Executing command in container {}: {}", handle, command.command);

        self.exec_raw(
            handle,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                command.command.clone(),
            ],
            &command.env_vars,
        )
        .await
    }

    async fn write_file(&self, handle: &str, path: &str, contents: &[u8]) -> Result<()> {
        let full_path = Self::resolve_path(path);
        let target = Path::new(&full_path);
        let parent = target
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());
        let file_name = target
            .file_name()
            .ok_or_else(|| ProviderError::FileError(format!("Invalid file path: {}", path)))?;

        let mkdir = self
            .exec_raw(
                handle,
                vec!["mkdir".to_string(), "-p".to_string(), parent.clone()],
                &HashMap::new(),
            )
            .await?;
        if !mkdir.success() {
            return Err(ProviderError::FileError(format!(
                "Failed to create {}: {}",
                parent,
                mkdir.stderr_lossy()
            )));
        }

        let tar_data = create_tar_archive(file_name, contents)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: parent,
            ..Default::default()
        };

        self.client
            .upload_to_container(handle, Some(options), tar_data.into())
            .await
            .map_err(|e| ProviderError::FileError(e.to_string()))?;

        debug!("Wrote {} bytes to {}:{}", contents.len(), handle, full_path);
        Ok(())
    }

    async fn read_file(&self, handle: &str, path: &str) -> Result<Vec<u8>> {
        let full_path = Self::resolve_path(path);
        let options = DownloadFromContainerOptions {
            path: full_path.clone(),
        };

        let mut stream = self.client.download_from_container(handle, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::FileError(e.to_string()))?;
            data.extend_from_slice(&bytes);
        }

        extract_single_file(&data)
            .map_err(|e| ProviderError::FileError(format!("{}: {}", full_path, e)))
    }

    async fn remove_file(&self, handle: &str, path: &str) -> Result<()> {
        let full_path = Self::resolve_path(path);
        let rm = self
            .exec_raw(
                handle,
                vec!["rm".to_string(), "-f".to_string(), full_path.clone()],
                &HashMap::new(),
            )
            .await?;
        if !rm.success() {
            return Err(ProviderError::FileError(format!(
                "Failed to remove {}: {}",
                full_path,
                rm.stderr_lossy()
            )));
        }
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        info!("Removing container: {}", handle);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone counts as destroyed
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(ProviderError::InternalError(e.to_string())),
        }
    }
}

/// An exec without an exit code never finished normally
fn exit_status(code: Option<i64>) -> i64 {
    code.unwrap_or(-1)
}

fn create_tar_archive(file_name: &std::ffi::OsStr, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();

    archive.append_data(&mut header, file_name, contents)?;
    archive.into_inner()
}

fn extract_single_file(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(data);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "archive contains no regular file",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_round_trip_single_file() {
        let data = create_tar_archive(std::ffi::OsStr::new("input.json"), b"{\"a\":1}").unwrap();
        let contents = extract_single_file(&data).unwrap();
        assert_eq!(contents, b"{\"a\":1}");
    }

    #[test]
    fn test_resolve_relative_path_uses_workdir() {
        assert_eq!(
            DockerProvider::resolve_path("input.json"),
            "/workspace/input.json"
        );
        assert_eq!(DockerProvider::resolve_path("/tmp/out.json"), "/tmp/out.json");
    }

    #[test]
    fn test_missing_exit_code_is_a_failure() {
        assert_eq!(exit_status(Some(0)), 0);
        assert_eq!(exit_status(Some(3)), 3);
        assert_eq!(exit_status(None), -1);
    }

    #[test]
    fn test_unit_config_conversion() {
        // connect_with_defaults does not contact the daemon
        let Ok(provider) = DockerProvider::new() else {
            return;
        };

        let config = UnitConfig {
            image: Some("alpine:latest".to_string()),
            exposed_ports: vec![8080],
            env_vars: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            ..Default::default()
        };

        let bollard_config = provider.to_bollard_config(&config);

        assert_eq!(bollard_config.image, Some("alpine:latest".to_string()));
        assert_eq!(bollard_config.env, Some(vec!["FOO=bar".to_string()]));
        assert!(bollard_config
            .exposed_ports
            .as_ref()
            .is_some_and(|ports| ports.contains_key("8080/tcp")));
        assert_eq!(bollard_config.working_dir, Some("/workspace".to_string()));
    }
}
