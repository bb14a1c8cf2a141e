//! Internal polling dispatch.
//!
//! When no external scheduler drives the workers, a background task calls
//! `run_once` on a fixed interval until the shutdown signal flips.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::OutboxWorker;

/// Counters for one polling loop.
#[derive(Debug, Default)]
pub struct PollingMetrics {
    pub ticks: AtomicU64,
    pub tasks_processed: AtomicU64,
    pub errors: AtomicU64,
}

impl PollingMetrics {
    pub fn snapshot(&self) -> PollingSnapshot {
        PollingSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingSnapshot {
    pub ticks: u64,
    pub tasks_processed: u64,
    pub errors: u64,
}

/// Spawn the polling loop for `worker`.
///
/// The returned handle resolves to the loop's metrics once `shutdown_rx`
/// observes `true` (or its sender is dropped).
pub fn spawn_polling(
    worker: Arc<OutboxWorker>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Arc<PollingMetrics>> {
    tokio::spawn(async move {
        let metrics = Arc::new(PollingMetrics::default());
        let limit = worker.engine.config().claim_batch_size;

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            worker_id = %worker.worker_id(),
            interval_ms = every.as_millis() as u64,
            "outbox polling started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    metrics.ticks.fetch_add(1, Ordering::Relaxed);
                    match worker.run_once(limit).await {
                        Ok(0) => tracing::trace!(worker_id = %worker.worker_id(), "idle tick"),
                        Ok(n) => {
                            metrics.tasks_processed.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            metrics.errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(worker_id = %worker.worker_id(), error = %e, "polling round failed");
                        }
                    }
                }
            }
        }

        let snapshot = metrics.snapshot();
        tracing::info!(
            worker_id = %worker.worker_id(),
            ticks = snapshot.ticks,
            tasks_processed = snapshot.tasks_processed,
            errors = snapshot.errors,
            "outbox polling stopped"
        );
        metrics
    })
}
