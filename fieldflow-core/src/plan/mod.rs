//! Execution Plans
//!
//! A plan is the ordered list of `(table, level, fields)` steps that must be
//! recomputed after one seed change, plus the edges that produced them and a
//! same-table batching summary. It is compiled once per task, consumed by the
//! executor and then discarded; only its trace outlives it.

mod compiler;
mod model;
mod trace;

pub use compiler::PlanCompiler;
pub use model::{ChangeType, ComputedSeed, ExecutionPlan, PlanEdge, PlanStep, SameTableBatch};
pub use trace::{PlanTrace, PLAN_TRACE_TARGET};
