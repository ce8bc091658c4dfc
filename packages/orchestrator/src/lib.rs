// ABOUTME: Workflow orchestration over isolated execution units
// ABOUTME: Shared, pipeline, parallel fan-out/fan-in, and master-worker topologies

pub mod engine;
pub mod error;
pub mod journal;
pub mod relay;
pub mod runner;
pub mod settings;
pub mod state;
pub mod types;

pub use engine::{Orchestrator, WorkflowResult};
pub use error::{FailureKind, StageError, StageErrorKind, WorkflowFailure};
pub use journal::{EventKind, Journal, WorkflowEvent, WorkflowState};
pub use relay::{Destination, RelayChannel, RelayEnvelope, RelayError};
pub use runner::StageRunner;
pub use settings::{OrchestratorSettings, SettingsError};
pub use state::{CompletedTask, ParticipantStatus, SharedState, SharedStateStore, StateError};
pub use types::{
    OutputSource, OutputSpec, PayloadShape, PipelineUnits, StageDefinition, StageTask,
    StagedFile, Topology, WorkflowRequest,
};
