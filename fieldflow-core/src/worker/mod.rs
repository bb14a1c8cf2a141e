//! Outbox worker.
//!
//! Claims tasks, runs them through the engine and records the outcome.
//! Several workers may share one outbox; the claim is the only coordination
//! between them. A task is always executed from scratch, so a task reclaimed
//! after a crash is simply run again.
//!
//! The lease is renewed before each task of a claimed batch and then every
//! third of the lease while the task runs, so a live worker never loses a
//! task to a second claimant. A renewal refused with `LeaseLost` abandons the
//! run.

mod polling;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::ComputedEngine;
use crate::error::{Error, OutboxError, Result};
use crate::executor::ExecutionReport;
use crate::outbox::{OutboxTask, RetryDecision};
use crate::plan::ComputedSeed;
use crate::ports::EngineEvent;

pub use crate::config::DispatchMode;
pub use polling::{spawn_polling, PollingMetrics, PollingSnapshot};

/// Result of [`OutboxWorker::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub rounds: usize,
    pub processed: usize,
    /// The round cap was reached while tasks were still being claimed.
    pub hit_round_cap: bool,
}

/// Claims and executes outbox tasks under one worker id.
pub struct OutboxWorker {
    engine: Arc<ComputedEngine>,
    worker_id: String,
}

impl OutboxWorker {
    /// Worker over `engine`'s outbox. `worker_id` fences its outcomes.
    pub fn new(engine: Arc<ComputedEngine>, worker_id: impl Into<String>) -> Self {
        Self {
            engine,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Start the configured dispatch mode. `External` starts nothing: the
    /// caller drives [`run_once`](Self::run_once) itself.
    pub fn start(
        self: Arc<Self>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Option<JoinHandle<Arc<PollingMetrics>>> {
        let dispatch = self.engine.config().dispatch;
        match dispatch {
            DispatchMode::External => None,
            DispatchMode::InternalPolling { interval_ms } => Some(spawn_polling(
                self,
                Duration::from_millis(interval_ms),
                shutdown_rx,
            )),
        }
    }

    /// Claim up to `limit` tasks and process each. Returns how many were
    /// claimed.
    ///
    /// Task failures are recorded on the task, not returned. Only a failed
    /// claim surfaces as an error. When the outbox rejects the outcome of one
    /// task, that is logged and the rest of the batch still runs; the task
    /// stays leased and is reclaimed once the lease lapses.
    pub async fn run_once(&self, limit: usize) -> Result<usize> {
        let config = self.engine.config();
        let tasks = self
            .engine
            .outbox()
            .claim(&self.worker_id, limit, config.lease_duration(), config.max_attempts)
            .await?;

        for task in &tasks {
            if let Err(e) = self.process(task).await {
                error!(
                    task_id = %task.id,
                    worker_id = %self.worker_id,
                    error = %e,
                    "could not record task outcome; continuing with the batch"
                );
            }
        }
        Ok(tasks.len())
    }

    /// Call `run_once` until a round claims nothing or `max_rounds` is hit.
    pub async fn drain(&self, max_rounds: usize) -> Result<DrainReport> {
        let limit = self.engine.config().claim_batch_size;
        let mut report = DrainReport::default();

        while report.rounds < max_rounds {
            let claimed = self.run_once(limit).await?;
            report.rounds += 1;
            if claimed == 0 {
                return Ok(report);
            }
            report.processed += claimed;
        }

        report.hit_round_cap = true;
        warn!(
            worker_id = %self.worker_id,
            rounds = report.rounds,
            processed = report.processed,
            "drain stopped at its round cap"
        );
        Ok(report)
    }

    async fn process(&self, task: &OutboxTask) -> Result<()> {
        // Earlier tasks of the batch have used up part of the claim's lease.
        let lease = self.engine.config().lease_duration();
        let renewed = self
            .engine
            .outbox()
            .extend_lease(task.id, &self.worker_id, lease)
            .await;
        if !self.fenced(task, renewed)? {
            return Ok(());
        }

        let outcome = match task.seed() {
            Ok(seed) => match self.run_leased(task, &seed).await? {
                Some(result) => result,
                None => return Ok(()),
            },
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(report) => {
                let recorded = self.engine.outbox().complete(task.id, &self.worker_id).await;
                if self.fenced(task, recorded)? {
                    debug!(
                        task_id = %task.id,
                        worker_id = %self.worker_id,
                        steps = report.plan.steps().len(),
                        cells = report.updated_cells,
                        "task done"
                    );
                    self.engine.emit(EngineEvent::TaskCompleted {
                        task_id: task.id,
                        updated_cells: report.updated_cells,
                        cell_errors: report.cell_errors,
                    });
                }
            }
            Err(err) => self.record_failure(task, err).await?,
        }
        Ok(())
    }

    /// Execute `seed` under the task timeout, renewing the lease every third
    /// of its duration. `None` when a renewal finds the task taken over; the
    /// execution is dropped at that point.
    async fn run_leased(
        &self,
        task: &OutboxTask,
        seed: &ComputedSeed,
    ) -> Result<Option<Result<ExecutionReport>>> {
        let config = self.engine.config();
        let timeout = config.task_timeout();
        let lease = config.lease_duration();
        let period = lease / 3;

        let run = tokio::time::timeout(timeout, self.engine.process(seed));
        tokio::pin!(run);
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                finished = &mut run => {
                    return Ok(Some(finished.unwrap_or_else(|_| Err(Error::Timeout(timeout)))));
                }
                _ = heartbeat.tick() => {
                    let renewed = self
                        .engine
                        .outbox()
                        .extend_lease(task.id, &self.worker_id, lease)
                        .await;
                    if !self.fenced(task, renewed)? {
                        return Ok(None);
                    }
                    debug!(task_id = %task.id, worker_id = %self.worker_id, "lease renewed");
                }
            }
        }
    }

    async fn record_failure(&self, task: &OutboxTask, err: Error) -> Result<()> {
        // The claim already counted this attempt.
        let attempts = task.attempts;
        let decision = if err.is_invariant_violation() || !err.is_retryable() {
            RetryDecision::GiveUp
        } else {
            self.engine.config().retry_policy().decide(attempts)
        };
        let retry_after = match decision {
            RetryDecision::RetryAfter(delay) => Some(delay),
            RetryDecision::GiveUp => None,
        };

        let message = err.to_string();
        let recorded = self
            .engine
            .outbox()
            .fail(task.id, &self.worker_id, &message, retry_after)
            .await;
        if !self.fenced(task, recorded)? {
            return Ok(());
        }

        match retry_after {
            Some(delay) => warn!(
                task_id = %task.id,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "task failed; will retry"
            ),
            None if err.is_invariant_violation() => error!(
                task_id = %task.id,
                attempts,
                error = %message,
                "invariant violation; task failed permanently"
            ),
            None => error!(
                task_id = %task.id,
                attempts,
                error = %message,
                "task failed permanently"
            ),
        }

        self.engine.emit(EngineEvent::TaskFailed {
            task_id: task.id,
            attempts,
            permanent: retry_after.is_none(),
            error: message,
        });
        Ok(())
    }

    /// `Ok(false)` when another worker took the task over; our outcome is
    /// dropped and theirs stands.
    fn fenced(&self, task: &OutboxTask, recorded: std::result::Result<(), OutboxError>) -> Result<bool> {
        match recorded {
            Ok(()) => Ok(true),
            Err(OutboxError::LeaseLost { .. }) => {
                info!(
                    task_id = %task.id,
                    worker_id = %self.worker_id,
                    "lease lost to another worker; discarding this execution"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
