// ABOUTME: Stage runner executing one task inside one unit: inject, run, extract, decode
// ABOUTME: Converts every unit-level failure into a typed StageError for the engine to judge

use crate::error::{StageError, StageErrorKind};
use crate::relay::{RelayChannel, RelayEnvelope};
use crate::types::{OutputSource, StageTask};
use sandflow_config::{SANDFLOW_INPUT, SANDFLOW_INPUT_PATH, SANDFLOW_STAGE};
use sandflow_sandbox::{CommandSpec, ExecutionUnit};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum stderr bytes kept on a stage failure
const STDERR_LIMIT: usize = 4096;

pub struct StageRunner {
    relay: Arc<RelayChannel>,
    input_path: String,
    default_timeout: Duration,
}

impl StageRunner {
    pub fn new(relay: Arc<RelayChannel>, input_path: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            relay,
            input_path: input_path.into(),
            default_timeout,
        }
    }

    pub fn input_path(&self) -> &str {
        &self.input_path
    }

    /// Run `task` against `unit` and capture its decoded output
    ///
    /// The unit is borrowed for the whole call. It is never released
    /// here; a unit left in `Failed` is the caller's to reclaim.
    pub async fn run_stage(
        &self,
        unit: &mut ExecutionUnit,
        task: &StageTask,
    ) -> Result<RelayEnvelope, StageError> {
        let stage = task.name();
        let definition = task.definition();
        info!(stage, unit_id = %unit.id(), index = task.index(), "Running stage");

        for file in &definition.files {
            unit.inject(&file.path, file.contents.as_bytes())
                .await
                .map_err(|e| StageError::from_unit(stage, e))?;
        }

        let input = serde_json::to_string(task.input()).map_err(|e| {
            StageError::new(stage, StageErrorKind::MalformedPayload, e.to_string())
        })?;

        let timeout = definition.timeout().unwrap_or(self.default_timeout);
        let mut command = CommandSpec::new(&definition.command, timeout)
            .with_env(SANDFLOW_INPUT_PATH, &self.input_path)
            .with_env(SANDFLOW_STAGE, stage);
        for (key, value) in &definition.env {
            command = command.with_env(key, value);
        }

        if unit.capabilities().file_transfer {
            unit.inject(&self.input_path, input.as_bytes())
                .await
                .map_err(|e| StageError::from_unit(stage, e))?;
        } else {
            debug!(stage, "Unit has no file transfer, passing input through environment");
            command = command.with_env(SANDFLOW_INPUT, input);
        }

        // A reused unit may still hold the previous task's output file
        if let OutputSource::File { path } = &definition.output.source {
            if unit.capabilities().file_transfer {
                unit.remove(path)
                    .await
                    .map_err(|e| StageError::from_unit(stage, e))?;
            }
        }

        let result = unit
            .execute(&command)
            .await
            .map_err(|e| StageError::from_unit(stage, e))?;

        if !result.success() {
            warn!(stage, exit_code = result.exit_code, "Stage exited with non-zero status");
            return Err(StageError::new(
                stage,
                StageErrorKind::ExecutionFailed,
                format!("command exited with status {}", result.exit_code),
            )
            .with_diagnostics(Some(result.exit_code), Some(truncate(&result.stderr_lossy()))));
        }

        let raw = match &definition.output.source {
            OutputSource::Stdout => result.stdout.clone(),
            OutputSource::File { path } => unit
                .extract(path)
                .await
                .map_err(|e| StageError::from_unit(stage, e))?,
        };

        let payload = definition.output.shape.decode(&raw).map_err(|reason| {
            StageError::new(stage, StageErrorKind::MalformedOutput, reason)
                .with_diagnostics(Some(result.exit_code), Some(truncate(&result.stderr_lossy())))
        })?;

        Ok(self.relay.capture(stage, payload))
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= STDERR_LIMIT {
        return text.to_string();
    }
    let mut end = STDERR_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PayloadShape, StageDefinition};
    use pretty_assertions::assert_eq;
    use sandflow_sandbox::testing::{ScriptOutput, ScriptedProvider};
    use sandflow_sandbox::{UnitAllocator, UnitConfig, UnitState};
    use serde_json::{json, Value};

    fn runner() -> StageRunner {
        StageRunner::new(
            Arc::new(RelayChannel::new()),
            "input.json",
            Duration::from_secs(5),
        )
    }

    fn doubler() -> ScriptedProvider {
        ScriptedProvider::new().on_command("python3 double.py", |ctx| {
            let n = ctx.input().and_then(|v| v["n"].as_i64()).unwrap_or(0);
            ScriptOutput::json(&json!({"n": n * 2}))
        })
    }

    #[tokio::test]
    async fn test_injects_input_and_decodes_stdout() {
        let provider = Arc::new(doubler());
        let allocator = UnitAllocator::new(provider.clone(), UnitConfig::default());
        let mut unit = allocator.acquire().await.unwrap();

        let task = StageTask::new(
            StageDefinition::new("double", "python3 double.py")
                .with_file("double.py", "print('scripted')"),
            json!({"n": 21}),
            0,
        );
        let envelope = runner().run_stage(&mut unit, &task).await.unwrap();

        assert_eq!(envelope.source, "double");
        assert_eq!(envelope.payload, json!({"n": 42}));
        assert_eq!(
            provider.file(unit.handle(), "double.py").unwrap(),
            b"print('scripted')".to_vec()
        );
        unit.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_env_input_without_file_transfer() {
        let provider = Arc::new(doubler().without_file_transfer());
        let allocator = UnitAllocator::new(provider, UnitConfig::default());
        let mut unit = allocator.acquire().await.unwrap();

        let task = StageTask::new(
            StageDefinition::new("double", "python3 double.py"),
            json!({"n": 4}),
            0,
        );
        let envelope = runner().run_stage(&mut unit, &task).await.unwrap();
        assert_eq!(envelope.payload, json!({"n": 8}));
        unit.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_diagnostics() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .on_command("python3 fail.py", |_| ScriptOutput::fail(2, "Traceback: boom")),
        );
        let allocator = UnitAllocator::new(provider, UnitConfig::default());
        let mut unit = allocator.acquire().await.unwrap();

        let task = StageTask::new(StageDefinition::new("fail", "python3 fail.py"), Value::Null, 0);
        let err = runner().run_stage(&mut unit, &task).await.unwrap_err();

        assert_eq!(err.kind, StageErrorKind::ExecutionFailed);
        assert_eq!(err.exit_code, Some(2));
        assert_eq!(err.stderr.as_deref(), Some("Traceback: boom"));
        unit.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_unit_failed() {
        let provider = Arc::new(ScriptedProvider::new().on_command_delayed(
            "python3 slow.py",
            Duration::from_secs(60),
            |_| ScriptOutput::stdout("{}"),
        ));
        let allocator = UnitAllocator::new(provider, UnitConfig::default());
        let mut unit = allocator.acquire().await.unwrap();

        let task = StageTask::new(
            StageDefinition::new("slow", "python3 slow.py").with_timeout(Duration::from_secs(2)),
            Value::Null,
            0,
        );
        let err = runner().run_stage(&mut unit, &task).await.unwrap_err();

        assert_eq!(err.kind, StageErrorKind::Timeout);
        assert_eq!(unit.state(), UnitState::Failed);
        unit.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_declared_output_file() {
        let provider = Arc::new(ScriptedProvider::new().on_command("python3 report.py", |ctx| {
            ctx.write("out/report.txt", "Average: 170.00");
            ScriptOutput::stdout("done")
        }));
        let allocator = UnitAllocator::new(provider, UnitConfig::default());
        let mut unit = allocator.acquire().await.unwrap();

        let task = StageTask::new(
            StageDefinition::new("report", "python3 report.py").with_output(
                OutputSource::File {
                    path: "out/report.txt".to_string(),
                },
                PayloadShape::Text,
            ),
            Value::Null,
            0,
        );
        let envelope = runner().run_stage(&mut unit, &task).await.unwrap();
        assert_eq!(envelope.payload, json!("Average: 170.00"));
        unit.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_output_file_is_cleared_before_running() {
        let provider = Arc::new(ScriptedProvider::new().on_command("python3 idle.py", |_| {
            ScriptOutput::stdout("")
        }));
        let allocator = UnitAllocator::new(provider, UnitConfig::default());
        let mut unit = allocator.acquire().await.unwrap();
        unit.inject("out.json", br#"{"stale": true}"#).await.unwrap();

        let task = StageTask::new(
            StageDefinition::new("idle", "python3 idle.py").with_output(
                OutputSource::File {
                    path: "out.json".to_string(),
                },
                PayloadShape::Object,
            ),
            Value::Null,
            0,
        );
        let err = runner().run_stage(&mut unit, &task).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Io);
        unit.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_output_is_malformed() {
        let provider = Arc::new(
            ScriptedProvider::new().on_command("python3 chatty.py", |_| {
                ScriptOutput::stdout("Processing...\nDone")
            }),
        );
        let allocator = UnitAllocator::new(provider, UnitConfig::default());
        let mut unit = allocator.acquire().await.unwrap();

        let task = StageTask::new(StageDefinition::new("chatty", "python3 chatty.py"), Value::Null, 0);
        let err = runner().run_stage(&mut unit, &task).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::MalformedOutput);
        assert!(unit.is_usable());
        unit.release().await.unwrap();
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(STDERR_LIMIT);
        let cut = truncate(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= STDERR_LIMIT + 3);
    }
}
