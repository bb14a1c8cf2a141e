//! FieldFlow Core
//!
//! The computed-field propagation engine of a spreadsheet/database hybrid.
//! When a record or field changes, every formula, lookup and rollup that
//! transitively depends on it (possibly in other tables, reached through
//! link fields) is recomputed in dependency order, off the write path.
//!
//! # Architecture
//!
//! - `graph`: per-base dependency index over `(table, field)` nodes,
//!   definition-time validation and the per-process graph cache
//! - `plan`: compiles a seed change into a levelled [`ExecutionPlan`]
//! - `executor`: runs a plan batch by batch against the record repository
//! - `outbox`: durable task queue with leases, fencing and bounded retry
//! - `worker`: claims tasks and drives them through the engine
//! - `realtime`: translates committed changes into OT ops for subscribers
//! - `ports`: the evaluator, repository and event interfaces the engine
//!   consumes
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fieldflow_core::{ComputedEngine, ComputedSeed, ChangeType, EngineConfig, OutboxWorker};
//!
//! let engine = Arc::new(ComputedEngine::new(config, repository, evaluator, outbox)?);
//!
//! // Write path: record what changed and return.
//! engine
//!     .enqueue(&ComputedSeed::records("bse1", "tblOrders", ChangeType::Update, ids))
//!     .await?;
//!
//! // Worker: recompute everything downstream.
//! let worker = OutboxWorker::new(engine.clone(), "worker-1");
//! worker.drain(100).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ids;
pub mod logging;
pub mod memory;
pub mod outbox;
pub mod plan;
pub mod ports;
pub mod realtime;
pub mod worker;

pub use config::{DispatchMode, EngineConfig};
pub use engine::ComputedEngine;
pub use error::{Error, Result};
pub use executor::{ComputedFieldUpdater, ExecutionReport};
pub use graph::{DependencyGraph, FieldDefinition, FieldKind, FieldNode, LinkDefinition};
pub use ids::{BaseId, FieldId, RecordId, TableId, TaskId};
pub use outbox::{InMemoryOutbox, OutboxStore, OutboxTask, TaskStatus};
pub use plan::{ChangeType, ComputedSeed, ExecutionPlan, PlanCompiler, PlanTrace};
pub use ports::{ChangeSink, Evaluator, RecordRepository};
pub use realtime::{Change, RealtimeHub};
pub use worker::{DrainReport, OutboxWorker};
