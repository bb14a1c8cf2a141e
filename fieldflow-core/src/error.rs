//! Error types for the propagation engine.
//!
//! Errors are split by layer. Per-cell evaluation failures are not errors at
//! all: they become [`ComputedError`](crate::ports::ComputedError) values
//! stored in the cell and never abort a task.

use std::time::Duration;

use thiserror::Error;

use crate::graph::FieldNode;
use crate::ids::{FieldId, TableId, TaskId};

/// Lookup failures against the dependency graph index.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    #[error("unknown field {field} in table {table}")]
    UnknownField { table: TableId, field: FieldId },
}

/// Rejections raised when a computed field is created or edited.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("field {field} references missing {missing}")]
    DanglingReference { field: FieldNode, missing: String },

    #[error("circular dependency: {}", format_path(.0))]
    CycleDetected(Vec<FieldNode>),
}

/// Invariant violations found while compiling a plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("cycle reached during traversal through {}", format_path(.0))]
    CycleDetected(Vec<FieldNode>),

    #[error("{0} scheduled in more than one step")]
    DuplicateScheduling(FieldNode),
}

/// Failure reported by the record repository.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("repository error: {message}")]
pub struct RepositoryError {
    pub message: String,
    pub retryable: bool,
}

impl RepositoryError {
    /// A transient failure; the task is retried.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Failures while executing a plan. Any of these aborts the whole task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("plan invariant violated: {0}")]
    Invariant(String),
}

/// Outbox storage failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("payload codec error: {0}")]
    Codec(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {task_id} is no longer leased by worker {worker_id}")]
    LeaseLost { task_id: TaskId, worker_id: String },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("outbox storage error: {0}")]
    Storage(String),
}

/// Configuration rejected by [`EngineConfig::validate`](crate::config::EngineConfig::validate).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid engine config: {0}")]
pub struct ConfigError(pub String);

/// Umbrella error for the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("task exceeded its {0:?} timeout")]
    Timeout(Duration),
}

impl Error {
    /// Whether this error signals a bug elsewhere (schema integrity, corrupt
    /// payload) rather than a transient condition.
    ///
    /// Tasks failing with these go straight to `failed`.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::Plan(_)
                | Error::Executor(ExecutorError::Invariant(_))
                | Error::Outbox(OutboxError::Codec(_))
        )
    }

    /// Whether the outbox should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Repository(e) | Error::Executor(ExecutorError::Repository(e)) => e.retryable,
            Error::Timeout(_) | Error::Outbox(OutboxError::Storage(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_path(path: &[FieldNode]) -> String {
    path.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
