//! Outbox task model and payload codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OutboxError;
use crate::ids::TaskId;
use crate::plan::ComputedSeed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

/// A queued "a change happened".
///
/// Moves `pending -> claimed -> (done | pending | failed)`. A claimed task
/// whose lease has expired is claimable again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxTask {
    pub id: TaskId,
    /// MessagePack-encoded [`ComputedSeed`].
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    /// Executions started so far; bumped on every claim.
    pub attempts: u32,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant (retry backoff).
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl OutboxTask {
    pub fn new(payload: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            claimed_by: None,
            lease_expires_at: None,
            available_at: now,
            last_error: None,
            created_at: now,
            finished_at: None,
        }
    }

    /// Decode the seed payload.
    pub fn seed(&self) -> Result<ComputedSeed, OutboxError> {
        decode_seed(&self.payload)
    }

    /// Whether a worker may claim the task at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => self.available_at <= now,
            TaskStatus::Claimed => self.lease_expires_at.is_some_and(|at| at <= now),
            TaskStatus::Done | TaskStatus::Failed => false,
        }
    }

    /// Whether `worker_id` still holds the lease.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == TaskStatus::Claimed && self.claimed_by.as_deref() == Some(worker_id)
    }
}

pub fn encode_seed(seed: &ComputedSeed) -> Result<Vec<u8>, OutboxError> {
    rmp_serde::to_vec_named(seed).map_err(|e| OutboxError::Codec(e.to_string()))
}

pub fn decode_seed(payload: &[u8]) -> Result<ComputedSeed, OutboxError> {
    rmp_serde::from_slice(payload).map_err(|e| OutboxError::Codec(e.to_string()))
}
