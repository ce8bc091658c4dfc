// ABOUTME: In-memory scripted provider for deterministic tests of unit-driving code
// ABOUTME: Binds command lines to Rust closures and records lifecycle counters and invocations

use crate::providers::{
    CommandSpec, ExecResult, Provider, ProviderCapabilities, ProviderError, ProviderInfo,
    ProviderStatus, Result, UnitConfig,
};
use async_trait::async_trait;
use sandflow_config::{SANDFLOW_INPUT, SANDFLOW_INPUT_PATH};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Output produced by a scripted command
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn json(value: &Value) -> Self {
        Self::stdout(value.to_string())
    }

    pub fn fail(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// View of one unit handed to a script closure
pub struct ScriptContext<'a> {
    pub handle: &'a str,
    pub command: &'a str,
    pub env: &'a HashMap<String, String>,
    files: &'a mut HashMap<String, Vec<u8>>,
}

impl ScriptContext<'_> {
    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize(path)).map(Vec::as_slice)
    }

    pub fn read_json(&self, path: &str) -> Option<Value> {
        self.read(path)
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }

    pub fn write(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.insert(normalize(path), contents.into());
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Input payload the way a stage script would find it: the inline
    /// variable first, then the file named by the input path variable
    pub fn input(&self) -> Option<Value> {
        if let Some(inline) = self.env(SANDFLOW_INPUT) {
            return serde_json::from_str(inline).ok();
        }
        self.env(SANDFLOW_INPUT_PATH)
            .and_then(|path| self.read_json(path))
    }
}

type ScriptFn = Arc<dyn Fn(&mut ScriptContext<'_>) -> ScriptOutput + Send + Sync>;

struct Script {
    run: ScriptFn,
    delay: Option<Duration>,
}

#[derive(Default)]
struct ScriptedState {
    units: HashMap<String, HashMap<String, Vec<u8>>>,
    destroyed: HashSet<String>,
    invocations: Vec<(String, String)>,
}

/// Provider whose units are in-memory maps and whose commands are closures
pub struct ScriptedProvider {
    scripts: HashMap<String, Script>,
    state: Mutex<ScriptedState>,
    capacity: Option<usize>,
    file_transfer: bool,
    fail_destroy: bool,
    created: AtomicUsize,
    destroy_calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    next_id: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            state: Mutex::new(ScriptedState::default()),
            capacity: None,
            file_transfer: true,
            fail_destroy: false,
            created: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Bind a command line (exact match, or longest registered prefix)
    pub fn on_command<F>(mut self, command: impl Into<String>, script: F) -> Self
    where
        F: Fn(&mut ScriptContext<'_>) -> ScriptOutput + Send + Sync + 'static,
    {
        self.scripts.insert(
            command.into(),
            Script {
                run: Arc::new(script),
                delay: None,
            },
        );
        self
    }

    /// Like `on_command`, sleeping `delay` before producing output
    pub fn on_command_delayed<F>(
        mut self,
        command: impl Into<String>,
        delay: Duration,
        script: F,
    ) -> Self
    where
        F: Fn(&mut ScriptContext<'_>) -> ScriptOutput + Send + Sync + 'static,
    {
        self.scripts.insert(
            command.into(),
            Script {
                run: Arc::new(script),
                delay: Some(delay),
            },
        );
        self
    }

    /// Refuse creation beyond `capacity` live units
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Units have no filesystem: write_file/read_file are unsupported
    pub fn without_file_transfer(mut self) -> Self {
        self.file_transfer = false;
        self
    }

    /// Every destroy call reports an error (the unit is still removed)
    pub fn with_failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Distinct units actually destroyed
    pub fn destroyed_count(&self) -> usize {
        self.lock().destroyed.len()
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.lock().units.len()
    }

    /// Highest number of commands observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    /// (handle, command) pairs in invocation order
    pub fn invocations(&self) -> Vec<(String, String)> {
        self.lock().invocations.clone()
    }

    /// Snapshot of one file inside a live unit
    pub fn file(&self, handle: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .units
            .get(handle)
            .and_then(|fs| fs.get(&normalize(path)).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, ScriptedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find_script(&self, command: &str) -> Option<&Script> {
        if let Some(script) = self.scripts.get(command) {
            return Some(script);
        }
        self.scripts
            .iter()
            .filter(|(key, _)| command.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, script)| script)
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            file_transfer: self.file_transfer,
            network_exposure: false,
        }
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "Scripted".to_string(),
            version: "test".to_string(),
            provider_type: "scripted".to_string(),
            capabilities: self.capabilities(),
            status: ProviderStatus::Ready,
        })
    }

    async fn create(&self, _config: &UnitConfig) -> Result<String> {
        let mut state = self.lock();
        if let Some(capacity) = self.capacity {
            if state.units.len() >= capacity {
                return Err(ProviderError::CapacityExhausted(format!(
                    "Scripted capacity {} reached",
                    capacity
                )));
            }
        }

        let handle = format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state.units.insert(handle.clone(), HashMap::new());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn run(&self, handle: &str, command: &CommandSpec) -> Result<ExecResult> {
        if !self.lock().units.contains_key(handle) {
            return Err(ProviderError::UnitNotFound(handle.to_string()));
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        self.lock()
            .invocations
            .push((handle.to_string(), command.command.clone()));

        let Some(script) = self.find_script(&command.command) else {
            return Ok(ExecResult {
                exit_code: 127,
                stdout: Vec::new(),
                stderr: format!("sh: {}: command not found", command.command).into_bytes(),
            });
        };

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let files = state
            .units
            .get_mut(handle)
            .ok_or_else(|| ProviderError::UnitNotFound(handle.to_string()))?;

        let mut ctx = ScriptContext {
            handle,
            command: &command.command,
            env: &command.env_vars,
            files,
        };
        let output = (script.run)(&mut ctx);

        Ok(ExecResult {
            exit_code: output.exit_code,
            stdout: output.stdout.into_bytes(),
            stderr: output.stderr.into_bytes(),
        })
    }

    async fn write_file(&self, handle: &str, path: &str, contents: &[u8]) -> Result<()> {
        if !self.file_transfer {
            return Err(ProviderError::NotSupported("file transfer".to_string()));
        }
        let mut state = self.lock();
        let files = state
            .units
            .get_mut(handle)
            .ok_or_else(|| ProviderError::UnitNotFound(handle.to_string()))?;
        files.insert(normalize(path), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, handle: &str, path: &str) -> Result<Vec<u8>> {
        if !self.file_transfer {
            return Err(ProviderError::NotSupported("file transfer".to_string()));
        }
        let state = self.lock();
        let files = state
            .units
            .get(handle)
            .ok_or_else(|| ProviderError::UnitNotFound(handle.to_string()))?;
        files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| ProviderError::FileError(format!("{}: no such file", path)))
    }

    async fn remove_file(&self, handle: &str, path: &str) -> Result<()> {
        if !self.file_transfer {
            return Err(ProviderError::NotSupported("file transfer".to_string()));
        }
        let mut state = self.lock();
        let files = state
            .units
            .get_mut(handle)
            .ok_or_else(|| ProviderError::UnitNotFound(handle.to_string()))?;
        files.remove(&normalize(path));
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.units.remove(handle).is_some() {
            state.destroyed.insert(handle.to_string());
        }
        drop(state);

        if self.fail_destroy {
            return Err(ProviderError::InternalError(format!(
                "injected destroy failure for {}",
                handle
            )));
        }
        Ok(())
    }
}
