// ABOUTME: Stage-level and workflow-level failure types
// ABOUTME: Maps unit, relay, and state errors onto the workflow failure taxonomy

use crate::journal::WorkflowEvent;
use crate::relay::{RelayEnvelope, RelayError};
use crate::state::StateError;
use sandflow_sandbox::UnitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    Io,
    ExecutionFailed,
    Timeout,
    MalformedOutput,
    MalformedPayload,
    Provision,
    Cancelled,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageErrorKind::Io => "io",
            StageErrorKind::ExecutionFailed => "execution_failed",
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::MalformedOutput => "malformed_output",
            StageErrorKind::MalformedPayload => "malformed_payload",
            StageErrorKind::Provision => "provision",
            StageErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Typed failure of one stage invocation
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Stage '{stage}' failed ({kind}): {message}")]
pub struct StageError {
    pub stage: String,
    pub kind: StageErrorKind,
    pub message: String,
    pub exit_code: Option<i64>,
    pub stderr: Option<String>,
}

impl StageError {
    pub fn new(stage: impl Into<String>, kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            kind,
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    pub fn with_diagnostics(mut self, exit_code: Option<i64>, stderr: Option<String>) -> Self {
        self.exit_code = exit_code;
        self.stderr = stderr.filter(|s| !s.is_empty());
        self
    }

    /// Classify a unit failure raised while running `stage`
    pub fn from_unit(stage: &str, error: UnitError) -> Self {
        let kind = match &error {
            UnitError::Timeout(_) => StageErrorKind::Timeout,
            UnitError::Io { .. } => StageErrorKind::Io,
            UnitError::Provision(_) => StageErrorKind::Provision,
            UnitError::Exec(_) | UnitError::NotUsable { .. } | UnitError::Teardown(_) => {
                StageErrorKind::ExecutionFailed
            }
        };
        Self::new(stage, kind, error.to_string())
    }

    pub fn from_relay(stage: &str, error: RelayError) -> Self {
        Self::new(stage, StageErrorKind::MalformedPayload, error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Provision,
    Io,
    ExecutionFailed,
    Timeout,
    MalformedOutput,
    MalformedPayload,
    InsufficientCapacity,
    InternalAggregation,
    DeadlineExceeded,
    InvalidWorkflow,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Provision => "provision",
            FailureKind::Io => "io",
            FailureKind::ExecutionFailed => "execution_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedOutput => "malformed_output",
            FailureKind::MalformedPayload => "malformed_payload",
            FailureKind::InsufficientCapacity => "insufficient_capacity",
            FailureKind::InternalAggregation => "internal_aggregation",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::InvalidWorkflow => "invalid_workflow",
        };
        f.write_str(s)
    }
}

impl From<StageErrorKind> for FailureKind {
    fn from(kind: StageErrorKind) -> Self {
        match kind {
            StageErrorKind::Io => FailureKind::Io,
            StageErrorKind::ExecutionFailed => FailureKind::ExecutionFailed,
            StageErrorKind::Timeout => FailureKind::Timeout,
            StageErrorKind::MalformedOutput => FailureKind::MalformedOutput,
            StageErrorKind::MalformedPayload => FailureKind::MalformedPayload,
            StageErrorKind::Provision => FailureKind::Provision,
            StageErrorKind::Cancelled => FailureKind::DeadlineExceeded,
        }
    }
}

/// Structured failure record returned by a workflow run
///
/// `completed` holds the envelopes captured from stages that succeeded
/// before the failure; `events` is the execution journal up to teardown.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("Workflow failed ({kind}){}: {message}", stage_suffix(.stage))]
pub struct WorkflowFailure {
    pub workflow_id: Uuid,
    pub stage: Option<String>,
    pub kind: FailureKind,
    pub message: String,
    pub exit_code: Option<i64>,
    pub stderr: Option<String>,
    #[serde(default)]
    pub completed: Vec<RelayEnvelope>,
    #[serde(default)]
    pub events: Vec<WorkflowEvent>,
}

fn stage_suffix(stage: &Option<String>) -> String {
    stage
        .as_ref()
        .map(|s| format!(" at stage '{}'", s))
        .unwrap_or_default()
}

impl WorkflowFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            workflow_id: Uuid::nil(),
            stage: None,
            kind,
            message: message.into(),
            exit_code: None,
            stderr: None,
            completed: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn at_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidWorkflow, message)
    }
}

impl From<StageError> for WorkflowFailure {
    fn from(error: StageError) -> Self {
        Self {
            workflow_id: Uuid::nil(),
            stage: Some(error.stage),
            kind: error.kind.into(),
            message: error.message,
            exit_code: error.exit_code,
            stderr: error.stderr,
            completed: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl From<StateError> for WorkflowFailure {
    fn from(error: StateError) -> Self {
        Self::new(FailureKind::InternalAggregation, error.to_string())
    }
}
