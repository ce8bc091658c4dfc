// ABOUTME: Workflow state machine and ordered execution journal
// ABOUTME: Records lifecycle transitions, unit churn, stage outcomes, relay hops, and claims

use crate::error::StageErrorKind;
use crate::relay::Destination;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum WorkflowState {
    Init,
    Provisioning,
    Running(String),
    Collecting,
    Teardown,
    Done,
    Failed,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Init => f.write_str("init"),
            WorkflowState::Provisioning => f.write_str("provisioning"),
            WorkflowState::Running(stage) => write!(f, "running({})", stage),
            WorkflowState::Collecting => f.write_str("collecting"),
            WorkflowState::Teardown => f.write_str("teardown"),
            WorkflowState::Done => f.write_str("done"),
            WorkflowState::Failed => f.write_str("failed"),
        }
    }
}

impl WorkflowState {
    /// Legal edges of the workflow state machine
    ///
    /// `Failed` is absorbing. Provisioning may recur mid-run because
    /// per-stage pipelines and worker pools acquire units lazily. A fan-out
    /// whose branches are all rejected before dispatch collects straight
    /// from provisioning.
    pub fn can_transition_to(&self, next: &WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Init, Provisioning)
                | (Init, Failed)
                | (Provisioning, Running(_))
                | (Provisioning, Collecting)
                | (Provisioning, Failed)
                | (Running(_), Running(_))
                | (Running(_), Provisioning)
                | (Running(_), Collecting)
                | (Running(_), Failed)
                | (Collecting, Provisioning)
                | (Collecting, Running(_))
                | (Collecting, Teardown)
                | (Collecting, Failed)
                | (Teardown, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        from: WorkflowState,
        to: WorkflowState,
    },
    UnitAcquired {
        unit_id: Uuid,
        handle: String,
    },
    UnitReleased {
        unit_id: Uuid,
    },
    TeardownFailed {
        unit_id: Uuid,
        error: String,
    },
    Degraded {
        requested: usize,
        acquired: usize,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    StageSucceeded {
        stage: String,
        index: usize,
        sequence: u64,
    },
    StageFailed {
        stage: String,
        index: usize,
        kind: StageErrorKind,
        message: String,
    },
    Relayed {
        source: String,
        destination: Destination,
        sequence: u64,
    },
    TaskClaimed {
        task_id: String,
        worker: String,
    },
    TaskCompleted {
        task_id: String,
        worker: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug)]
struct JournalInner {
    state: WorkflowState,
    events: Vec<WorkflowEvent>,
}

/// Per-workflow journal shared by every concurrently running stage future
#[derive(Debug)]
pub struct Journal {
    workflow_id: Uuid,
    inner: Mutex<JournalInner>,
}

impl Journal {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            inner: Mutex::new(JournalInner {
                state: WorkflowState::Init,
                events: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JournalInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn state(&self) -> WorkflowState {
        self.lock().state.clone()
    }

    pub fn record(&self, kind: EventKind) {
        self.lock().events.push(WorkflowEvent {
            at: Utc::now(),
            kind,
        });
    }

    /// Move to `next`; illegal edges are logged and ignored
    pub fn transition(&self, next: WorkflowState) -> bool {
        let mut inner = self.lock();
        if inner.state == next && !matches!(next, WorkflowState::Running(_)) {
            return true;
        }
        if !inner.state.can_transition_to(&next) {
            warn!(
                workflow_id = %self.workflow_id,
                from = %inner.state,
                to = %next,
                "Ignoring illegal workflow transition"
            );
            return false;
        }

        info!(workflow_id = %self.workflow_id, from = %inner.state, to = %next, "Workflow state change");
        let from = std::mem::replace(&mut inner.state, next.clone());
        inner.events.push(WorkflowEvent {
            at: Utc::now(),
            kind: EventKind::StateChanged { from, to: next },
        });
        true
    }

    /// Stages (name, dispatch index) that started but have not yet finished
    pub fn in_flight_stages(&self) -> Vec<(String, usize)> {
        let inner = self.lock();
        let mut open: Vec<(String, usize)> = Vec::new();
        for event in &inner.events {
            match &event.kind {
                EventKind::StageStarted { stage, index } => open.push((stage.clone(), *index)),
                EventKind::StageSucceeded { stage, index, .. }
                | EventKind::StageFailed { stage, index, .. } => {
                    if let Some(pos) = open.iter().position(|(s, i)| s == stage && i == index) {
                        open.remove(pos);
                    }
                }
                _ => {}
            }
        }
        open
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.lock().events.clone()
    }
}
