// ABOUTME: Workflow definition types: topologies, stage templates, output contracts, dispatched tasks
// ABOUTME: Includes payload shape decoding used by stage output extraction and relay validation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Shared,
    Pipeline,
    Parallel,
    #[serde(alias = "master-worker")]
    MasterWorker,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Topology::Shared => "shared",
            Topology::Pipeline => "pipeline",
            Topology::Parallel => "parallel",
            Topology::MasterWorker => "master_worker",
        };
        f.write_str(s)
    }
}

/// How pipeline stages map onto units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineUnits {
    /// Fresh unit per stage, released as soon as the stage finishes
    #[default]
    PerStage,
    /// One unit per stage, all acquired before the first stage runs
    PerStagePreprovisioned,
    /// One unit reused by every stage
    Shared,
}

/// Expected structure of a payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    #[default]
    Any,
    Object,
    Array,
    Number,
    Text,
    /// Array of task descriptors; output may also be JSON-lines
    TaskList,
}

impl fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayloadShape::Any => "any",
            PayloadShape::Object => "object",
            PayloadShape::Array => "array",
            PayloadShape::Number => "number",
            PayloadShape::Text => "text",
            PayloadShape::TaskList => "task_list",
        };
        f.write_str(s)
    }
}

impl PayloadShape {
    /// Check an already-decoded payload against the shape
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let ok = match self {
            PayloadShape::Any => true,
            PayloadShape::Object => value.is_object(),
            PayloadShape::Array | PayloadShape::TaskList => value.is_array(),
            PayloadShape::Number => value.is_number(),
            PayloadShape::Text => value.is_string(),
        };

        if ok {
            Ok(())
        } else {
            Err(format!("expected {}, got {}", self, json_type_name(value)))
        }
    }

    /// Decode raw captured output into a payload of this shape
    pub fn decode(&self, raw: &[u8]) -> Result<Value, String> {
        let text = std::str::from_utf8(raw).map_err(|e| format!("output is not UTF-8: {}", e))?;
        let trimmed = text.trim();

        match self {
            PayloadShape::Text => Ok(Value::String(trimmed.to_string())),
            PayloadShape::TaskList => decode_task_list(trimmed),
            _ => {
                if trimmed.is_empty() {
                    return Err("output is empty".to_string());
                }
                let value: Value =
                    serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON: {}", e))?;
                self.validate(&value)?;
                Ok(value)
            }
        }
    }
}

fn decode_task_list(trimmed: &str) -> Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return match value {
            Value::Array(_) => Ok(value),
            // a single JSON-lines descriptor
            Value::Object(_) => Ok(Value::Array(vec![value])),
            other => Err(format!("expected task_list, got {}", json_type_name(&other))),
        };
    }

    let mut tasks = Vec::new();
    for (line_no, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let task = serde_json::from_str(line)
            .map_err(|e| format!("line {} is not a JSON task descriptor: {}", line_no + 1, e))?;
        tasks.push(task);
    }
    Ok(Value::Array(tasks))
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Where a stage's result is read from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputSource {
    #[default]
    Stdout,
    File {
        path: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub source: OutputSource,
    #[serde(default)]
    pub shape: PayloadShape,
}

/// A file written into the unit before the stage's input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub path: String,
    pub contents: String,
}

/// User-facing template for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Shell command run inside the unit
    pub command: String,
    #[serde(default)]
    pub files: Vec<StagedFile>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub output: OutputSpec,
    /// Shape the relayed input must have before this stage may run
    #[serde(default)]
    pub input_shape: Option<PayloadShape>,
    /// Fixed input, used instead of the workflow input (shared and parallel only)
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            files: Vec::new(),
            env: HashMap::new(),
            output: OutputSpec::default(),
            input_shape: None,
            input: None,
            timeout_secs: None,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push(StagedFile {
            path: path.into(),
            contents: contents.into(),
        });
        self
    }

    pub fn with_output(mut self, source: OutputSource, shape: PayloadShape) -> Self {
        self.output = OutputSpec { source, shape };
        self
    }

    pub fn with_input_shape(mut self, shape: PayloadShape) -> Self {
        self.input_shape = Some(shape);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// One dispatched unit of work; immutable once created
#[derive(Debug, Clone, PartialEq)]
pub struct StageTask {
    definition: StageDefinition,
    input: Value,
    index: usize,
}

impl StageTask {
    pub fn new(definition: StageDefinition, input: Value, index: usize) -> Self {
        Self {
            definition,
            input,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Dispatch position within the topology step
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Single workflow invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub topology: Topology,
    pub stages: Vec<StageDefinition>,
    /// Fan-in stage for the parallel topology
    #[serde(default)]
    pub coordinator: Option<StageDefinition>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub strict_parallelism: Option<bool>,
    #[serde(default)]
    pub pipeline_units: PipelineUnits,
    /// Maximum descriptors claimed by master-worker workers
    #[serde(default)]
    pub task_budget: Option<usize>,
}

impl WorkflowRequest {
    pub fn new(topology: Topology, stages: Vec<StageDefinition>) -> Self {
        Self {
            topology,
            stages,
            coordinator: None,
            input: Value::Null,
            concurrency: None,
            deadline_secs: None,
            strict_parallelism: None,
            pipeline_units: PipelineUnits::default(),
            task_budget: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_coordinator(mut self, coordinator: StageDefinition) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs().max(1));
        self
    }

    pub fn with_strict_parallelism(mut self, strict: bool) -> Self {
        self.strict_parallelism = Some(strict);
        self
    }

    pub fn with_pipeline_units(mut self, policy: PipelineUnits) -> Self {
        self.pipeline_units = policy;
        self
    }

    pub fn with_task_budget(mut self, budget: usize) -> Self {
        self.task_budget = Some(budget);
        self
    }

    /// Role and shape checks that do not need a provider
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err(format!("{} topology needs at least one stage", self.topology));
        }

        for stage in self.stages.iter().chain(self.coordinator.iter()) {
            if stage.name.trim().is_empty() {
                return Err("stage names must not be empty".to_string());
            }
            if stage.command.trim().is_empty() {
                return Err(format!("stage '{}' has an empty command", stage.name));
            }
            if stage.timeout_secs == Some(0) {
                return Err(format!("stage '{}' has a zero timeout", stage.name));
            }
        }

        if self.concurrency == Some(0) {
            return Err("concurrency must be at least 1".to_string());
        }
        if self.deadline_secs == Some(0) {
            return Err("deadline must be at least 1 second".to_string());
        }

        if self.coordinator.is_some() && self.topology != Topology::Parallel {
            return Err(format!(
                "a coordinator is only valid for the parallel topology, not {}",
                self.topology
            ));
        }
        if self.task_budget.is_some() && self.topology != Topology::MasterWorker {
            return Err("task_budget is only valid for the master_worker topology".to_string());
        }

        match self.topology {
            Topology::MasterWorker => {
                if self.stages.len() != 2 {
                    return Err(format!(
                        "master_worker needs exactly two stages (master, worker), got {}",
                        self.stages.len()
                    ));
                }
                if self.stages.iter().any(|s| s.input.is_some()) {
                    return Err("master_worker stages take no fixed input".to_string());
                }
            }
            Topology::Pipeline => {
                if self.stages.iter().any(|s| s.input.is_some()) {
                    return Err(
                        "pipeline stages take their input from the previous stage".to_string(),
                    );
                }
            }
            Topology::Shared | Topology::Parallel => {}
        }

        Ok(())
    }
}
