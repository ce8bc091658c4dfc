// ABOUTME: Shared state store with FIFO task queues, at-most-once claims, and a key/value map
// ABOUTME: Every mutation runs under one process-wide lock; claimed tasks are never re-queued

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

pub type TaskId = String;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Queue '{0}' does not exist")]
    UnknownQueue(String),

    #[error("Queue '{0}' already exists")]
    QueueExists(String),

    #[error("Task '{task_id}' appears more than once in queue '{queue}'")]
    DuplicateTask { queue: String, task_id: TaskId },

    #[error("Task '{task_id}' in queue '{queue}' was never claimed")]
    NotClaimed { queue: String, task_id: TaskId },

    #[error("Task '{task_id}' in queue '{queue}' was already completed")]
    DuplicateCompletion { queue: String, task_id: TaskId },
}

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParticipantStatus {
    Idle,
    Working { task_id: TaskId },
    Finished,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub task_id: TaskId,
    pub claimant: String,
    pub result: Value,
}

/// Point-in-time copy of one queue plus participant statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    pub queue: String,
    pub pending: Vec<TaskId>,
    /// Claimed and neither completed nor failed
    pub in_flight: Vec<TaskId>,
    /// In completion order
    pub completed: Vec<CompletedTask>,
    pub failed: Vec<TaskId>,
    /// Every claim ever granted, keyed by task
    pub claimed_by: BTreeMap<TaskId, String>,
    pub participants: BTreeMap<String, ParticipantStatus>,
}

#[derive(Debug, Default)]
struct TaskQueue {
    pending: VecDeque<TaskId>,
    claimed_by: BTreeMap<TaskId, String>,
    completed: Vec<CompletedTask>,
    finished: HashSet<TaskId>,
    failed: Vec<TaskId>,
    claim_limit: Option<usize>,
    participants: BTreeMap<String, ParticipantStatus>,
}

impl TaskQueue {
    fn claimant_of(&self, queue: &str, task_id: &str) -> Result<String> {
        self.claimed_by
            .get(task_id)
            .cloned()
            .ok_or_else(|| StateError::NotClaimed {
                queue: queue.to_string(),
                task_id: task_id.to_string(),
            })
    }

    fn finish(&mut self, queue: &str, task_id: &str) -> Result<()> {
        if !self.finished.insert(task_id.to_string()) {
            warn!(queue, task_id, "Task finished twice");
            return Err(StateError::DuplicateCompletion {
                queue: queue.to_string(),
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    queues: HashMap<String, TaskQueue>,
    values: HashMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct SharedStateStore {
    inner: Mutex<StoreInner>,
}

impl SharedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a FIFO queue; `claim_limit` caps how many tasks may ever be claimed
    pub fn create_queue(
        &self,
        queue: &str,
        task_ids: Vec<TaskId>,
        claim_limit: Option<usize>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.queues.contains_key(queue) {
            return Err(StateError::QueueExists(queue.to_string()));
        }

        let mut seen = HashSet::new();
        for id in &task_ids {
            if !seen.insert(id) {
                return Err(StateError::DuplicateTask {
                    queue: queue.to_string(),
                    task_id: id.clone(),
                });
            }
        }

        debug!(queue, tasks = task_ids.len(), ?claim_limit, "Created task queue");
        inner.queues.insert(
            queue.to_string(),
            TaskQueue {
                pending: task_ids.into(),
                claim_limit,
                ..TaskQueue::default()
            },
        );
        Ok(())
    }

    /// Atomically take the head of the queue for `claimant`
    ///
    /// Returns `None` once the queue is empty or its claim limit is reached.
    pub fn claim_next(&self, queue: &str, claimant: &str) -> Result<Option<TaskId>> {
        let mut inner = self.lock();
        let tasks = queue_mut(&mut inner, queue)?;

        if let Some(limit) = tasks.claim_limit {
            if tasks.claimed_by.len() >= limit {
                return Ok(None);
            }
        }

        let Some(task_id) = tasks.pending.pop_front() else {
            return Ok(None);
        };
        tasks.claimed_by.insert(task_id.clone(), claimant.to_string());
        tasks.participants.insert(
            claimant.to_string(),
            ParticipantStatus::Working {
                task_id: task_id.clone(),
            },
        );

        debug!(queue, claimant, task_id = %task_id, "Task claimed");
        Ok(Some(task_id))
    }

    /// Record a result for a claimed task; completing twice is an error
    pub fn mark_complete(&self, queue: &str, task_id: &str, result: Value) -> Result<()> {
        let mut inner = self.lock();
        let tasks = queue_mut(&mut inner, queue)?;
        let claimant = tasks.claimant_of(queue, task_id)?;
        tasks.finish(queue, task_id)?;

        tasks.completed.push(CompletedTask {
            task_id: task_id.to_string(),
            claimant: claimant.clone(),
            result,
        });
        tasks.participants.insert(claimant, ParticipantStatus::Idle);
        Ok(())
    }

    /// Record that a claimed task failed; it is not re-queued
    pub fn mark_failed(&self, queue: &str, task_id: &str, reason: &str) -> Result<()> {
        let mut inner = self.lock();
        let tasks = queue_mut(&mut inner, queue)?;
        let claimant = tasks.claimant_of(queue, task_id)?;
        tasks.finish(queue, task_id)?;

        tasks.failed.push(task_id.to_string());
        tasks.participants.insert(
            claimant,
            ParticipantStatus::Failed {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    pub fn read_snapshot(&self, queue: &str) -> Result<SharedState> {
        let inner = self.lock();
        let tasks = inner
            .queues
            .get(queue)
            .ok_or_else(|| StateError::UnknownQueue(queue.to_string()))?;

        let in_flight = tasks
            .claimed_by
            .keys()
            .filter(|id| !tasks.finished.contains(*id))
            .cloned()
            .collect();

        Ok(SharedState {
            queue: queue.to_string(),
            pending: tasks.pending.iter().cloned().collect(),
            in_flight,
            completed: tasks.completed.clone(),
            failed: tasks.failed.clone(),
            claimed_by: tasks.claimed_by.clone(),
            participants: tasks.participants.clone(),
        })
    }

    pub fn set_status(&self, queue: &str, participant: &str, status: ParticipantStatus) -> Result<()> {
        let mut inner = self.lock();
        queue_mut(&mut inner, queue)?
            .participants
            .insert(participant.to_string(), status);
        Ok(())
    }

    pub fn status(&self, queue: &str, participant: &str) -> Option<ParticipantStatus> {
        self.lock()
            .queues
            .get(queue)
            .and_then(|tasks| tasks.participants.get(participant).cloned())
    }

    pub fn put_value(&self, key: &str, value: Value) -> Option<Value> {
        self.lock().values.insert(key.to_string(), value)
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    /// Drop a queue and return its final snapshot
    pub fn remove_queue(&self, queue: &str) -> Result<SharedState> {
        let snapshot = self.read_snapshot(queue)?;
        self.lock().queues.remove(queue);
        Ok(snapshot)
    }

    /// Remove every queue and value
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.queues.clear();
        inner.values.clear();
    }
}

fn queue_mut<'a>(inner: &'a mut StoreInner, queue: &str) -> Result<&'a mut TaskQueue> {
    inner
        .queues
        .get_mut(queue)
        .ok_or_else(|| StateError::UnknownQueue(queue.to_string()))
}
