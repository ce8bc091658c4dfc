// ABOUTME: Parallel fan-out/fan-in topology with a join barrier and dispatch-ordered aggregation
// ABOUTME: Lanes pull tasks from a shared cursor so a degraded pool reuses units sequentially

use super::{Orchestrator, RunContext};
use crate::error::{StageError, StageErrorKind, WorkflowFailure};
use crate::journal::WorkflowState;
use crate::relay::RelayEnvelope;
use crate::types::{StageTask, WorkflowRequest};
use futures::future::join_all;
use sandflow_sandbox::ExecutionUnit;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Source name of the fan-in aggregate envelope
const FAN_IN_SOURCE: &str = "fan_in";

type LaneOutcome = (usize, Result<RelayEnvelope, StageError>);

impl Orchestrator {
    pub(super) async fn run_parallel(
        &self,
        ctx: &RunContext,
        request: &WorkflowRequest,
        pool: &mut Vec<ExecutionUnit>,
    ) -> Result<RelayEnvelope, WorkflowFailure> {
        let task_count = request.stages.len();
        let lanes = self.acquire_batch(ctx, pool, ctx.concurrency.min(task_count)).await?;

        let tasks: Vec<Result<StageTask, StageError>> = request
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| -> Result<StageTask, StageError> {
                let input = stage.input.clone().unwrap_or_else(|| request.input.clone());
                let relayed = self.forward(ctx, self.relay.ingress(input), stage)?;
                Ok(StageTask::new(stage.clone(), relayed.payload, index))
            })
            .collect();

        let cursor = AtomicUsize::new(0);
        let lane_outcomes = join_all(
            pool[lanes.clone()]
                .iter_mut()
                .enumerate()
                .map(|(lane, unit)| self.parallel_lane(ctx, lane, unit, &tasks, &cursor)),
        )
        .await;

        let mut outcomes: Vec<Option<Result<RelayEnvelope, StageError>>> =
            (0..task_count).map(|_| None).collect();
        for (index, outcome) in lane_outcomes.into_iter().flatten() {
            outcomes[index] = Some(outcome);
        }

        ctx.journal.transition(WorkflowState::Collecting);

        let mut results = Vec::new();
        let mut failed = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(Ok(envelope)) => results.push(envelope.payload),
                Some(Err(e)) => failed.push(failure_record(index, &e)),
                None => {
                    let e = StageError::new(
                        &request.stages[index].name,
                        StageErrorKind::Provision,
                        "no execution unit left to run this task",
                    );
                    failed.push(failure_record(index, &e));
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                workflow_id = %ctx.workflow_id,
                "{} of {} parallel tasks failed",
                failed.len(),
                task_count
            );
        }

        let aggregate = self.relay.capture(
            FAN_IN_SOURCE,
            json!({ "results": results, "failed": failed }),
        );

        let Some(coordinator) = &request.coordinator else {
            return self.deliver(ctx, aggregate);
        };

        let relayed = self.forward(ctx, aggregate, coordinator)?;
        let task = StageTask::new(coordinator.clone(), relayed.payload, task_count);

        let slot = match pool[lanes.clone()].iter().position(|unit| unit.is_usable()) {
            Some(offset) => lanes.start + offset,
            None => self.acquire_into(ctx, pool).await?,
        };
        let output = self.run_task(ctx, &mut pool[slot], &task).await?;

        ctx.journal.transition(WorkflowState::Collecting);
        self.deliver(ctx, output)
    }

    /// Pull tasks from the shared cursor until it runs out or the lane
    /// loses its unit
    async fn parallel_lane(
        &self,
        ctx: &RunContext,
        lane: usize,
        unit: &mut ExecutionUnit,
        tasks: &[Result<StageTask, StageError>],
        cursor: &AtomicUsize,
    ) -> Vec<LaneOutcome> {
        let mut done = Vec::new();
        loop {
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(task) = tasks.get(index) else {
                break;
            };

            let outcome = match task {
                Ok(task) => self.run_task(ctx, unit, task).await,
                Err(e) => Err(e.clone()),
            };
            done.push((index, outcome));

            if !self.ensure_usable(ctx, unit).await {
                warn!(workflow_id = %ctx.workflow_id, lane, "Lane stopped after losing its unit");
                break;
            }
        }
        debug!(workflow_id = %ctx.workflow_id, lane, tasks = done.len(), "Lane drained");
        done
    }
}

fn failure_record(index: usize, error: &StageError) -> Value {
    json!({
        "index": index,
        "stage": error.stage,
        "kind": error.kind,
        "message": error.message,
    })
}
