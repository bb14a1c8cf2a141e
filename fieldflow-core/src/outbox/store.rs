//! Outbox storage.
//!
//! The outbox is the single point of mutual exclusion between workers: a
//! claim must atomically move a task to `claimed` so that exactly one worker
//! executes it at a time. Completion and failure are fenced by worker id, so
//! a worker whose lease expired and was taken over cannot overwrite the new
//! owner's outcome.
//!
//! `attempts` counts executions started, so it grows at claim time. A worker
//! that dies mid-task still spends an attempt, and a task whose lease keeps
//! lapsing is parked in `failed` once the cap is reached instead of cycling
//! through claims forever.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::clock::{after, Clock, SystemClock};
use super::task::{encode_seed, OutboxTask, TaskStatus};
use crate::error::OutboxError;
use crate::ids::TaskId;
use crate::plan::ComputedSeed;

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
}

impl OutboxStats {
    /// Tasks in any status.
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.done + self.failed
    }
}

/// Durable task queue shared by every worker of a base. Implementations
/// must make each transition atomic.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a task for `seed`. Called on the write path; never blocks on
    /// propagation work.
    async fn enqueue(&self, seed: &ComputedSeed) -> Result<TaskId, OutboxError>;

    /// Atomically claim up to `limit` claimable tasks, oldest first.
    ///
    /// Each claim counts as an attempt. A task that has already started
    /// `max_attempts` executions is moved to `failed` rather than claimed.
    async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        max_attempts: u32,
    ) -> Result<Vec<OutboxTask>, OutboxError>;

    /// Push the lease of a held task out to `now + lease`. Fails with
    /// `LeaseLost` once another worker has taken the task over.
    async fn extend_lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), OutboxError>;

    /// Mark a claimed task done.
    async fn complete(&self, task_id: TaskId, worker_id: &str) -> Result<(), OutboxError>;

    /// Record the error of the current attempt. `retry_after` makes the task pending again
    /// after the delay; `None` parks it in `failed`.
    async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), OutboxError>;

    /// Look a task up by id.
    async fn get(&self, task_id: TaskId) -> Result<Option<OutboxTask>, OutboxError>;

    /// Operator intervention: reset a failed task to pending with no attempts.
    async fn requeue_failed(&self, task_id: TaskId) -> Result<(), OutboxError>;

    /// Delete done tasks finished before `older_than`.
    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError>;

    /// Count tasks by status.
    async fn stats(&self) -> Result<OutboxStats, OutboxError>;
}

/// Outbox held in process memory. A single mutex makes every transition
/// atomic.
pub struct InMemoryOutbox {
    tasks: Mutex<IndexMap<TaskId, OutboxTask>>,
    clock: Arc<dyn Clock>,
    complete_failures: Mutex<VecDeque<OutboxError>>,
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryOutbox {
    /// Empty outbox on the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty outbox reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Mutex::new(IndexMap::new()),
            clock,
            complete_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next `complete` call fail with `error`.
    pub fn fail_next_complete(&self, error: OutboxError) {
        self.complete_failures.lock().push_back(error);
    }

    /// Append a task with an arbitrary payload.
    pub fn enqueue_raw(&self, payload: Vec<u8>) -> TaskId {
        let task = OutboxTask::new(payload, self.clock.now());
        let id = task.id;
        self.tasks.lock().insert(id, task);
        id
    }

    /// Snapshot of every task, in enqueue order.
    pub fn tasks(&self) -> Vec<OutboxTask> {
        self.tasks.lock().values().cloned().collect()
    }
}

fn lease_lost(task_id: TaskId, worker_id: &str) -> OutboxError {
    OutboxError::LeaseLost {
        task_id,
        worker_id: worker_id.to_string(),
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn enqueue(&self, seed: &ComputedSeed) -> Result<TaskId, OutboxError> {
        let id = self.enqueue_raw(encode_seed(seed)?);
        debug!(task_id = %id, table_id = %seed.table_id, records = seed.record_ids.len(), "task enqueued");
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        max_attempts: u32,
    ) -> Result<Vec<OutboxTask>, OutboxError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.lock();
        let mut claimed = Vec::new();

        for task in tasks.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !task.is_claimable(now) {
                continue;
            }
            if task.attempts >= max_attempts {
                error!(
                    task_id = %task.id,
                    previous = task.claimed_by.as_deref().unwrap_or_default(),
                    attempts = task.attempts,
                    "lease expired on the last allowed attempt; parking task"
                );
                task.status = TaskStatus::Failed;
                task.claimed_by = None;
                task.lease_expires_at = None;
                task.finished_at = Some(now);
                task.last_error = Some(format!("lease expired after {} attempts", task.attempts));
                continue;
            }
            if let Some(previous) = task.claimed_by.as_deref() {
                warn!(task_id = %task.id, previous, worker_id, "reclaiming task with expired lease");
            }
            task.attempts += 1;
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(worker_id.to_string());
            task.lease_expires_at = Some(after(now, lease));
            claimed.push(task.clone());
        }

        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&task_id).ok_or(OutboxError::NotFound(task_id))?;
        if !task.is_held_by(worker_id) {
            return Err(lease_lost(task_id, worker_id));
        }

        task.lease_expires_at = Some(after(now, lease));
        Ok(())
    }

    async fn complete(&self, task_id: TaskId, worker_id: &str) -> Result<(), OutboxError> {
        if let Some(error) = self.complete_failures.lock().pop_front() {
            return Err(error);
        }
        let now = self.clock.now();
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&task_id).ok_or(OutboxError::NotFound(task_id))?;
        if !task.is_held_by(worker_id) {
            return Err(lease_lost(task_id, worker_id));
        }

        task.status = TaskStatus::Done;
        task.claimed_by = None;
        task.lease_expires_at = None;
        task.finished_at = Some(now);
        Ok(())
    }

    async fn fail(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&task_id).ok_or(OutboxError::NotFound(task_id))?;
        if !task.is_held_by(worker_id) {
            return Err(lease_lost(task_id, worker_id));
        }

        task.last_error = Some(error.to_string());
        task.claimed_by = None;
        task.lease_expires_at = None;
        match retry_after {
            Some(delay) => {
                task.status = TaskStatus::Pending;
                task.available_at = after(now, delay);
            }
            None => {
                task.status = TaskStatus::Failed;
                task.finished_at = Some(now);
            }
        }
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<OutboxTask>, OutboxError> {
        Ok(self.tasks.lock().get(&task_id).cloned())
    }

    async fn requeue_failed(&self, task_id: TaskId) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&task_id).ok_or(OutboxError::NotFound(task_id))?;
        if task.status != TaskStatus::Failed {
            return Err(OutboxError::InvalidTransition {
                task_id,
                from: task.status.as_str(),
                to: TaskStatus::Pending.as_str(),
            });
        }

        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.available_at = now;
        task.finished_at = None;
        Ok(())
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.status == TaskStatus::Done && t.finished_at.is_some_and(|at| at < older_than))
        });
        Ok(before - tasks.len())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let tasks = self.tasks.lock();
        let mut stats = OutboxStats::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Claimed => stats.claimed += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
