// ABOUTME: Master-worker topology: a master stage plans tasks, a bounded worker pool claims them
// ABOUTME: Claims go through the shared state store so every descriptor reaches at most one worker

use super::{Orchestrator, RunContext};
use crate::error::{FailureKind, StageError, WorkflowFailure};
use crate::journal::{EventKind, WorkflowState};
use crate::relay::{Destination, RelayEnvelope};
use crate::state::{ParticipantStatus, TaskId};
use crate::types::{PayloadShape, StageDefinition, StageTask, WorkflowRequest};
use futures::future::join_all;
use sandflow_sandbox::ExecutionUnit;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

const AGGREGATE_SOURCE: &str = "workers";

type WorkerOutcome = (usize, Result<RelayEnvelope, StageError>);

/// Name of the task queue a master-worker run keeps in the shared store
pub(super) fn task_queue(workflow_id: Uuid) -> String {
    format!("{}/tasks", workflow_id)
}

/// Read-only view of the plan shared by every worker lane
struct Plan<'a> {
    queue: &'a str,
    master: &'a str,
    worker: &'a StageDefinition,
    descriptors: &'a [Value],
    index_of: &'a HashMap<TaskId, usize>,
}

impl Orchestrator {
    pub(super) async fn run_master_worker(
        &self,
        ctx: &RunContext,
        request: &WorkflowRequest,
        pool: &mut Vec<ExecutionUnit>,
    ) -> Result<RelayEnvelope, WorkflowFailure> {
        let (master, worker) = match request.stages.as_slice() {
            [master, worker] => (master, worker),
            _ => {
                return Err(WorkflowFailure::invalid(
                    "master_worker needs exactly two stages",
                ))
            }
        };

        let master_slot = self.acquire_into(ctx, pool).await?;
        let relayed = self.forward(ctx, self.relay.ingress(request.input.clone()), master)?;
        let master_task = StageTask::new(master.clone(), relayed.payload, 0);
        let plan = self.run_task(ctx, &mut pool[master_slot], &master_task).await?;
        self.release_unit(ctx, &mut pool[master_slot]).await;

        let plan = self
            .relay
            .relay(
                plan,
                Destination::Stage(worker.name.clone()),
                Some(PayloadShape::TaskList),
            )
            .map_err(|e| WorkflowFailure::from(StageError::from_relay(&worker.name, e)))?;
        ctx.journal.record(EventKind::Relayed {
            source: plan.source.clone(),
            destination: plan.destination.clone(),
            sequence: plan.sequence,
        });
        let descriptors = match plan.payload {
            Value::Array(items) => items,
            _ => Vec::new(),
        };

        let queue = task_queue(ctx.workflow_id);
        let ids: Vec<TaskId> = (0..descriptors.len()).map(|i| format!("task-{}", i)).collect();
        let index_of: HashMap<TaskId, usize> =
            ids.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();
        self.state.create_queue(&queue, ids, request.task_budget)?;

        let claimable = request
            .task_budget
            .map_or(descriptors.len(), |budget| budget.min(descriptors.len()));
        info!(
            workflow_id = %ctx.workflow_id,
            planned = descriptors.len(),
            claimable,
            "Master produced task plan"
        );

        let shared = Plan {
            queue: &queue,
            master: &master.name,
            worker,
            descriptors: &descriptors,
            index_of: &index_of,
        };

        let mut outcomes: Vec<Option<Result<RelayEnvelope, StageError>>> =
            (0..descriptors.len()).map(|_| None).collect();

        if claimable > 0 {
            let workers = self
                .acquire_batch(ctx, pool, ctx.concurrency.min(claimable))
                .await?;

            let lane_results = join_all(pool[workers].iter_mut().enumerate().map(|(n, unit)| {
                self.worker_lane(ctx, &shared, format!("worker-{}", n + 1), unit)
            }))
            .await;

            for lane in lane_results {
                for (index, outcome) in lane? {
                    outcomes[index] = Some(outcome);
                }
            }
        }

        ctx.journal.transition(WorkflowState::Collecting);
        let snapshot = self.state.remove_queue(&queue)?;

        if !snapshot.in_flight.is_empty() {
            return Err(WorkflowFailure::new(
                FailureKind::InternalAggregation,
                format!(
                    "{} claimed tasks never finished: {:?}",
                    snapshot.in_flight.len(),
                    snapshot.in_flight
                ),
            ));
        }

        let mut results = Vec::new();
        let mut failed = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(Ok(envelope)) => results.push(envelope.payload),
                Some(Err(e)) => failed.push(json!({
                    "index": index,
                    "task_id": format!("task-{}", index),
                    "stage": e.stage,
                    "kind": e.kind,
                    "message": e.message,
                })),
                None => {}
            }
        }

        if results.len() != snapshot.completed.len() {
            return Err(WorkflowFailure::new(
                FailureKind::InternalAggregation,
                format!(
                    "{} results collected but {} tasks completed",
                    results.len(),
                    snapshot.completed.len()
                ),
            ));
        }

        let unprocessed: Vec<Value> = snapshot
            .pending
            .iter()
            .filter_map(|id| index_of.get(id).map(|&i| descriptors[i].clone()))
            .collect();
        if !unprocessed.is_empty() {
            warn!(
                workflow_id = %ctx.workflow_id,
                "{} planned tasks left unprocessed",
                unprocessed.len()
            );
        }

        ctx.set_snapshot(snapshot);
        let aggregate = self.relay.capture(
            AGGREGATE_SOURCE,
            json!({
                "results": results,
                "failed": failed,
                "unprocessed": unprocessed,
            }),
        );
        self.deliver(ctx, aggregate)
    }

    /// Claim, run, and record tasks until the queue refuses more claims
    async fn worker_lane(
        &self,
        ctx: &RunContext,
        plan: &Plan<'_>,
        name: String,
        unit: &mut ExecutionUnit,
    ) -> Result<Vec<WorkerOutcome>, WorkflowFailure> {
        self.state
            .set_status(plan.queue, &name, ParticipantStatus::Idle)?;

        let mut done = Vec::new();
        while let Some(task_id) = self.state.claim_next(plan.queue, &name)? {
            ctx.journal.record(EventKind::TaskClaimed {
                task_id: task_id.clone(),
                worker: name.clone(),
            });

            let index = plan.index_of.get(&task_id).copied().ok_or_else(|| {
                WorkflowFailure::new(
                    FailureKind::InternalAggregation,
                    format!("claimed unknown task '{}'", task_id),
                )
            })?;

            let descriptor = self
                .relay
                .capture(plan.master, plan.descriptors[index].clone());
            let outcome = match self.forward(ctx, descriptor, plan.worker) {
                Ok(relayed) => {
                    let task = StageTask::new(plan.worker.clone(), relayed.payload, index);
                    self.run_task(ctx, unit, &task).await
                }
                Err(e) => Err(e),
            };

            match &outcome {
                Ok(envelope) => {
                    self.state
                        .mark_complete(plan.queue, &task_id, envelope.payload.clone())?;
                    ctx.journal.record(EventKind::TaskCompleted {
                        task_id: task_id.clone(),
                        worker: name.clone(),
                    });
                }
                Err(e) => self.state.mark_failed(plan.queue, &task_id, &e.message)?,
            }
            done.push((index, outcome));

            if !self.ensure_usable(ctx, unit).await {
                self.state.set_status(
                    plan.queue,
                    &name,
                    ParticipantStatus::Failed {
                        reason: "execution unit lost".to_string(),
                    },
                )?;
                return Ok(done);
            }
        }

        self.state
            .set_status(plan.queue, &name, ParticipantStatus::Finished)?;
        Ok(done)
    }
}
