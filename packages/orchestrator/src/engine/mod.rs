// ABOUTME: Orchestration engine owning units, relay, and shared state for workflow runs
// ABOUTME: Drives the topology state machine with deadline cancellation and teardown on every exit path

mod master_worker;
mod parallel;
mod sequential;

use crate::error::{FailureKind, StageError, StageErrorKind, WorkflowFailure};
use crate::journal::{EventKind, Journal, WorkflowEvent, WorkflowState};
use crate::relay::{Destination, RelayChannel, RelayEnvelope};
use crate::runner::StageRunner;
use crate::settings::{OrchestratorSettings, MAX_CONCURRENCY_LIMIT};
use crate::state::{SharedState, SharedStateStore, StateError};
use crate::types::{StageDefinition, StageTask, Topology, WorkflowRequest};
use futures::future::join_all;
use sandflow_sandbox::{ExecutionUnit, Provider, UnitAllocator, UnitConfig, UnitState};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Successful workflow outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub topology: Topology,
    /// Final aggregate envelope, addressed to `external`
    pub output: RelayEnvelope,
    /// Every stage output captured during the run, in capture order
    pub stages: Vec<RelayEnvelope>,
    /// Final task queue snapshot (master-worker only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_state: Option<SharedState>,
    pub events: Vec<WorkflowEvent>,
}

/// State for one run, shared by every stage future of that run
pub(crate) struct RunContext {
    workflow_id: Uuid,
    journal: Journal,
    captured: Mutex<Vec<RelayEnvelope>>,
    snapshot: Mutex<Option<SharedState>>,
    concurrency: usize,
    strict: bool,
}

impl RunContext {
    fn new(request: &WorkflowRequest, settings: &OrchestratorSettings) -> Self {
        let workflow_id = Uuid::new_v4();
        Self {
            workflow_id,
            journal: Journal::new(workflow_id),
            captured: Mutex::new(Vec::new()),
            snapshot: Mutex::new(None),
            concurrency: request
                .concurrency
                .unwrap_or(settings.max_concurrency)
                .clamp(1, MAX_CONCURRENCY_LIMIT),
            strict: request
                .strict_parallelism
                .unwrap_or(settings.strict_parallelism),
        }
    }

    fn capture(&self, envelope: &RelayEnvelope) {
        self.captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(envelope.clone());
    }

    fn captured(&self) -> Vec<RelayEnvelope> {
        let mut envelopes = self
            .captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        envelopes.sort_by_key(|e| e.sequence);
        envelopes
    }

    fn set_snapshot(&self, snapshot: SharedState) {
        *self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(snapshot);
    }

    fn take_snapshot(&self) -> Option<SharedState> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Coordinates execution units across the four topologies
///
/// Lifecycle is `new -> run (any number of times) -> teardown`. Units
/// acquired by a run never outlive it: they are released on success,
/// on failure, and after the workflow deadline cancels in-flight stages.
pub struct Orchestrator {
    allocator: UnitAllocator,
    settings: OrchestratorSettings,
    relay: Arc<RelayChannel>,
    runner: StageRunner,
    state: SharedStateStore,
    closed: AtomicBool,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn Provider>, settings: OrchestratorSettings) -> Self {
        Self::with_unit_config(provider, UnitConfig::default(), settings)
    }

    pub fn with_unit_config(
        provider: Arc<dyn Provider>,
        unit_config: UnitConfig,
        settings: OrchestratorSettings,
    ) -> Self {
        let relay = Arc::new(RelayChannel::new());
        let runner = StageRunner::new(
            relay.clone(),
            settings.input_path.clone(),
            settings.stage_timeout,
        );
        Self {
            allocator: UnitAllocator::new(provider, unit_config),
            settings,
            relay,
            runner,
            state: SharedStateStore::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Shared state store used by master-worker runs
    pub fn state(&self) -> &SharedStateStore {
        &self.state
    }

    /// Units currently acquired and not yet released
    pub fn live_units(&self) -> usize {
        self.allocator.live_units()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run one workflow to completion
    ///
    /// Never panics on workflow errors: the result is either the final
    /// aggregate or a structured failure naming stage and error kind.
    pub async fn run(&self, request: WorkflowRequest) -> Result<WorkflowResult, WorkflowFailure> {
        let ctx = RunContext::new(&request, &self.settings);

        if self.is_closed() {
            ctx.journal.transition(WorkflowState::Failed);
            return Err(self.finish_failure(
                &ctx,
                WorkflowFailure::invalid("orchestrator has been torn down"),
            ));
        }
        if let Err(reason) = request.validate() {
            ctx.journal.transition(WorkflowState::Failed);
            return Err(self.finish_failure(&ctx, WorkflowFailure::invalid(reason)));
        }

        info!(
            workflow_id = %ctx.workflow_id,
            topology = %request.topology,
            stages = request.stages.len(),
            concurrency = ctx.concurrency,
            "Starting workflow"
        );

        let deadline = request
            .deadline_secs
            .map(Duration::from_secs)
            .or(self.settings.workflow_deadline);

        let mut pool: Vec<ExecutionUnit> = Vec::new();
        let outcome = match deadline {
            Some(limit) => {
                match tokio::time::timeout(limit, self.execute(&ctx, &request, &mut pool)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(self.deadline_failure(&ctx, limit)),
                }
            }
            None => self.execute(&ctx, &request, &mut pool).await,
        };

        match outcome {
            Ok(output) => {
                ctx.journal.transition(WorkflowState::Teardown);
                self.release_pool(&ctx, &mut pool).await;
                ctx.journal.transition(WorkflowState::Done);
                info!(workflow_id = %ctx.workflow_id, "Workflow completed");

                Ok(WorkflowResult {
                    workflow_id: ctx.workflow_id,
                    topology: request.topology,
                    output,
                    stages: ctx.captured(),
                    shared_state: ctx.take_snapshot(),
                    events: ctx.journal.events(),
                })
            }
            Err(failure) => {
                ctx.journal.transition(WorkflowState::Failed);
                self.release_pool(&ctx, &mut pool).await;
                if request.topology == Topology::MasterWorker {
                    let queue = master_worker::task_queue(ctx.workflow_id);
                    match self.state.remove_queue(&queue) {
                        Ok(_) | Err(StateError::UnknownQueue(_)) => {}
                        Err(e) => {
                            debug!(workflow_id = %ctx.workflow_id, %queue, error = %e, "Task queue cleanup failed");
                        }
                    }
                }
                Err(self.finish_failure(&ctx, failure))
            }
        }
    }

    /// Close the orchestrator; later runs are rejected
    ///
    /// Idempotent. Returns the number of units still live, which is zero
    /// unless a run future was dropped mid-flight and its background
    /// destroys have not finished yet.
    pub async fn teardown(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return self.live_units();
        }
        self.state.clear();

        let live = self.live_units();
        if live > 0 {
            warn!("Orchestrator torn down with {} units still live", live);
        } else {
            info!("Orchestrator torn down");
        }
        live
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        request: &WorkflowRequest,
        pool: &mut Vec<ExecutionUnit>,
    ) -> Result<RelayEnvelope, WorkflowFailure> {
        match request.topology {
            Topology::Shared => self.run_shared(ctx, request, pool).await,
            Topology::Pipeline => self.run_pipeline(ctx, request, pool).await,
            Topology::Parallel => self.run_parallel(ctx, request, pool).await,
            Topology::MasterWorker => self.run_master_worker(ctx, request, pool).await,
        }
    }

    fn finish_failure(&self, ctx: &RunContext, mut failure: WorkflowFailure) -> WorkflowFailure {
        error!(
            workflow_id = %ctx.workflow_id,
            stage = failure.stage.as_deref().unwrap_or("-"),
            kind = %failure.kind,
            "Workflow failed: {}",
            failure.message
        );
        failure.workflow_id = ctx.workflow_id;
        failure.completed = ctx.captured();
        failure.events = ctx.journal.events();
        failure
    }

    fn deadline_failure(&self, ctx: &RunContext, limit: Duration) -> WorkflowFailure {
        let in_flight = ctx.journal.in_flight_stages();
        for (stage, index) in &in_flight {
            ctx.journal.record(EventKind::StageFailed {
                stage: stage.clone(),
                index: *index,
                kind: StageErrorKind::Cancelled,
                message: "cancelled by workflow deadline".to_string(),
            });
        }

        let failure = WorkflowFailure::new(
            FailureKind::DeadlineExceeded,
            format!("workflow deadline of {}s exceeded", limit.as_secs()),
        );
        match in_flight.into_iter().next() {
            Some((stage, _)) => failure.at_stage(stage),
            None => failure,
        }
    }

    /// Acquire one unit into the pool and return its slot
    async fn acquire_into(
        &self,
        ctx: &RunContext,
        pool: &mut Vec<ExecutionUnit>,
    ) -> Result<usize, WorkflowFailure> {
        ctx.journal.transition(WorkflowState::Provisioning);
        let unit = self
            .allocator
            .acquire()
            .await
            .map_err(|e| WorkflowFailure::new(FailureKind::Provision, e.to_string()))?;

        ctx.journal.record(EventKind::UnitAcquired {
            unit_id: unit.id(),
            handle: unit.handle().to_string(),
        });
        pool.push(unit);
        Ok(pool.len() - 1)
    }

    /// Acquire up to `requested` units, degrading to a smaller pool
    /// unless strict parallelism is set
    async fn acquire_batch(
        &self,
        ctx: &RunContext,
        pool: &mut Vec<ExecutionUnit>,
        requested: usize,
    ) -> Result<Range<usize>, WorkflowFailure> {
        ctx.journal.transition(WorkflowState::Provisioning);
        let batch = self.allocator.acquire_up_to(requested).await;

        let start = pool.len();
        for unit in &batch.units {
            ctx.journal.record(EventKind::UnitAcquired {
                unit_id: unit.id(),
                handle: unit.handle().to_string(),
            });
        }
        pool.extend(batch.units);
        let acquired = pool.len() - start;
        let shortfall = batch
            .shortfall_error
            .map(|e| e.to_string())
            .unwrap_or_default();

        if acquired == 0 {
            return Err(WorkflowFailure::new(
                FailureKind::Provision,
                format!("no execution unit could be provisioned: {}", shortfall),
            ));
        }
        if acquired < requested {
            if ctx.strict {
                return Err(WorkflowFailure::new(
                    FailureKind::InsufficientCapacity,
                    format!(
                        "acquired {} of {} units with strict parallelism: {}",
                        acquired, requested, shortfall
                    ),
                ));
            }
            warn!(
                workflow_id = %ctx.workflow_id,
                requested,
                acquired,
                "Degrading to a smaller unit pool"
            );
            ctx.journal
                .record(EventKind::Degraded { requested, acquired });
        }

        Ok(start..pool.len())
    }

    async fn release_unit(&self, ctx: &RunContext, unit: &mut ExecutionUnit) {
        if unit.state() == UnitState::Terminated {
            return;
        }
        let unit_id = unit.id();

        let error = match tokio::time::timeout(self.settings.teardown_timeout, unit.release()).await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "release timed out after {}s",
                self.settings.teardown_timeout.as_secs()
            )),
        };

        match error {
            None => ctx.journal.record(EventKind::UnitReleased { unit_id }),
            Some(error) => {
                warn!(workflow_id = %ctx.workflow_id, %unit_id, "Unit teardown failed: {}", error);
                ctx.journal
                    .record(EventKind::TeardownFailed { unit_id, error });
            }
        }
    }

    async fn release_pool(&self, ctx: &RunContext, pool: &mut [ExecutionUnit]) {
        join_all(pool.iter_mut().map(|unit| self.release_unit(ctx, unit))).await;
    }

    /// Swap a failed unit for a fresh one; false when none can be acquired
    async fn ensure_usable(&self, ctx: &RunContext, slot: &mut ExecutionUnit) -> bool {
        if slot.is_usable() {
            return true;
        }

        match self.allocator.acquire().await {
            Ok(fresh) => {
                ctx.journal.record(EventKind::UnitAcquired {
                    unit_id: fresh.id(),
                    handle: fresh.handle().to_string(),
                });
                let mut failed = std::mem::replace(slot, fresh);
                self.release_unit(ctx, &mut failed).await;
                true
            }
            Err(e) => {
                warn!(workflow_id = %ctx.workflow_id, "Could not replace failed unit: {}", e);
                self.release_unit(ctx, slot).await;
                false
            }
        }
    }

    /// Re-address `envelope` to `stage`, validating its declared input shape
    fn forward(
        &self,
        ctx: &RunContext,
        envelope: RelayEnvelope,
        stage: &StageDefinition,
    ) -> Result<RelayEnvelope, StageError> {
        let relayed = self
            .relay
            .relay(
                envelope,
                Destination::Stage(stage.name.clone()),
                stage.input_shape,
            )
            .map_err(|e| StageError::from_relay(&stage.name, e))?;

        ctx.journal.record(EventKind::Relayed {
            source: relayed.source.clone(),
            destination: relayed.destination.clone(),
            sequence: relayed.sequence,
        });
        Ok(relayed)
    }

    /// Hand the final envelope to the caller
    fn deliver(&self, ctx: &RunContext, envelope: RelayEnvelope) -> Result<RelayEnvelope, WorkflowFailure> {
        let delivered = self
            .relay
            .relay(envelope, Destination::External, None)
            .map_err(|e| WorkflowFailure::new(FailureKind::InternalAggregation, e.to_string()))?;

        ctx.journal.record(EventKind::Relayed {
            source: delivered.source.clone(),
            destination: Destination::External,
            sequence: delivered.sequence,
        });
        Ok(delivered)
    }

    /// Run one task on one unit, journaling its outcome
    async fn run_task(
        &self,
        ctx: &RunContext,
        unit: &mut ExecutionUnit,
        task: &StageTask,
    ) -> Result<RelayEnvelope, StageError> {
        ctx.journal
            .transition(WorkflowState::Running(task.name().to_string()));
        ctx.journal.record(EventKind::StageStarted {
            stage: task.name().to_string(),
            index: task.index(),
        });

        match self.runner.run_stage(unit, task).await {
            Ok(envelope) => {
                ctx.journal.record(EventKind::StageSucceeded {
                    stage: task.name().to_string(),
                    index: task.index(),
                    sequence: envelope.sequence,
                });
                ctx.capture(&envelope);
                Ok(envelope)
            }
            Err(e) => {
                warn!(
                    workflow_id = %ctx.workflow_id,
                    stage = task.name(),
                    kind = %e.kind,
                    "Stage failed: {}",
                    e.message
                );
                ctx.journal.record(EventKind::StageFailed {
                    stage: task.name().to_string(),
                    index: task.index(),
                    kind: e.kind,
                    message: e.message.clone(),
                });
                Err(e)
            }
        }
    }
}
