//! Plan execution.
//!
//! [`ComputedFieldUpdater`] resolves the records each planned field affects,
//! evaluates them through the [`Evaluator`](crate::ports::Evaluator) port and
//! commits the results table by table.

mod affected;
mod updater;

pub use updater::{ComputedFieldUpdater, ExecutionReport, DANGLING_REFERENCE, DEFAULT_WRITE_CHUNK_SIZE};
