// ABOUTME: Shared-environment and pipeline topologies, both strictly sequential
// ABOUTME: Pipeline stages receive exactly their predecessor's envelope; shared stages share one unit

use super::{Orchestrator, RunContext};
use crate::error::WorkflowFailure;
use crate::journal::WorkflowState;
use crate::relay::RelayEnvelope;
use crate::types::{PipelineUnits, StageTask, WorkflowRequest};
use sandflow_sandbox::ExecutionUnit;
use tracing::{info, warn};

impl Orchestrator {
    /// One unit, every stage in order; later stages see earlier stages'
    /// files, so each receives the workflow input (or its fixed input)
    pub(super) async fn run_shared(
        &self,
        ctx: &RunContext,
        request: &WorkflowRequest,
        pool: &mut Vec<ExecutionUnit>,
    ) -> Result<RelayEnvelope, WorkflowFailure> {
        let slot = self.acquire_into(ctx, pool).await?;

        let mut last = None;
        for (index, stage) in request.stages.iter().enumerate() {
            let input = stage.input.clone().unwrap_or_else(|| request.input.clone());
            let relayed = self.forward(ctx, self.relay.ingress(input), stage)?;
            let task = StageTask::new(stage.clone(), relayed.payload, index);
            last = Some(self.run_task(ctx, &mut pool[slot], &task).await?);
        }

        ctx.journal.transition(WorkflowState::Collecting);
        let last = last.ok_or_else(|| WorkflowFailure::invalid("shared topology ran no stages"))?;
        self.deliver(ctx, last)
    }

    pub(super) async fn run_pipeline(
        &self,
        ctx: &RunContext,
        request: &WorkflowRequest,
        pool: &mut Vec<ExecutionUnit>,
    ) -> Result<RelayEnvelope, WorkflowFailure> {
        let stage_count = request.stages.len();
        let preprovisioned = match request.pipeline_units {
            PipelineUnits::PerStage => None,
            PipelineUnits::PerStagePreprovisioned => {
                Some(self.acquire_batch(ctx, pool, stage_count).await?)
            }
            PipelineUnits::Shared => Some(self.acquire_batch(ctx, pool, 1).await?),
        };

        let mut envelope = self.relay.ingress(request.input.clone());
        for (index, stage) in request.stages.iter().enumerate() {
            let relayed = self.forward(ctx, envelope, stage)?;
            let task = StageTask::new(stage.clone(), relayed.payload, index);

            let slot = match &preprovisioned {
                Some(range) => range.start + index % range.len(),
                None => self.acquire_into(ctx, pool).await?,
            };

            envelope = match self.run_task(ctx, &mut pool[slot], &task).await {
                Ok(output) => output,
                Err(e) => {
                    if let Some(range) = &preprovisioned {
                        let remaining = range.len().saturating_sub(index + 1);
                        if remaining > 0 {
                            warn!(
                                workflow_id = %ctx.workflow_id,
                                "Aborting pipeline at '{}', tearing down {} pre-provisioned units",
                                stage.name,
                                remaining
                            );
                        }
                    }
                    return Err(e.into());
                }
            };

            if preprovisioned.is_none() {
                self.release_unit(ctx, &mut pool[slot]).await;
            }
            info!(workflow_id = %ctx.workflow_id, stage = %stage.name, "Pipeline stage {} of {} done", index + 1, stage_count);
        }

        ctx.journal.transition(WorkflowState::Collecting);
        self.deliver(ctx, envelope)
    }
}
