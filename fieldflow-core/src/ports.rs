//! Ports
//!
//! The engine only owns dependency tracking, planning and execution. Formula
//! evaluation, row storage, the realtime transport and whoever wants to watch
//! the engine are collaborators reached through the traits in this module.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RepositoryError;
use crate::graph::{FieldDefinition, LinkDefinition};
use crate::ids::{BaseId, FieldId, RecordId, TableId, TaskId};
use crate::plan::PlanTrace;
use crate::realtime::Change;

/// A stored record: its id and the cell values it holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    pub id: RecordId,
    pub fields: BTreeMap<FieldId, Value>,
}

impl Row {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<FieldId>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn get(&self, field: &FieldId) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Record ids held in a link cell.
    ///
    /// Link cells hold an array of ids, either bare strings or `{ "id": .. }`
    /// objects; a single object or string is accepted too.
    pub fn linked_ids(&self, link_field: &FieldId) -> Vec<RecordId> {
        fn one(v: &Value) -> Option<RecordId> {
            match v {
                Value::String(s) => Some(RecordId::new(s.clone())),
                Value::Object(map) => map
                    .get("id")
                    .and_then(Value::as_str)
                    .map(RecordId::from),
                _ => None,
            }
        }

        match self.fields.get(link_field) {
            Some(Value::Array(items)) => items.iter().filter_map(one).collect(),
            Some(v) => one(v).into_iter().collect(),
            None => Vec::new(),
        }
    }
}

/// A typed evaluation failure, stored in the cell instead of a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedError {
    pub code: String,
    pub message: String,
}

impl ComputedError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// What gets written into a computed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum CellValue {
    Value(Value),
    Error(ComputedError),
}

impl CellValue {
    /// The JSON stored in the row and pushed to clients.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Value(v) => v.clone(),
            CellValue::Error(e) => serde_json::json!({ "error": e }),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }
}

impl From<Result<Value, ComputedError>> for CellValue {
    fn from(result: Result<Value, ComputedError>) -> Self {
        match result {
            Ok(v) => CellValue::Value(v),
            Err(e) => CellValue::Error(e),
        }
    }
}

/// One computed cell to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub record_id: RecordId,
    pub field_id: FieldId,
    pub value: CellValue,
}

/// Everything the evaluator may read for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordContext {
    pub table_id: TableId,
    pub record: Row,
    /// Foreign rows reached through each link field the evaluated field uses.
    pub linked: BTreeMap<FieldId, Vec<Row>>,
    /// Whole foreign tables scanned by conditional rollups.
    pub scanned: BTreeMap<TableId, Arc<[Row]>>,
}

impl RecordContext {
    pub fn new(table_id: TableId, record: Row) -> Self {
        Self {
            table_id,
            record,
            linked: BTreeMap::new(),
            scanned: BTreeMap::new(),
        }
    }
}

/// The formula/lookup/rollup evaluator.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate one field for one record.
    async fn evaluate(
        &self,
        field: &FieldDefinition,
        ctx: &RecordContext,
    ) -> Result<Value, ComputedError>;

    /// Evaluate one field over many records. Results are positional.
    ///
    /// Evaluators with a vectorized path override this.
    async fn evaluate_batch(
        &self,
        field: &FieldDefinition,
        contexts: &[RecordContext],
    ) -> Vec<Result<Value, ComputedError>> {
        let mut results = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            results.push(self.evaluate(field, ctx).await);
        }
        results
    }
}

/// Row storage.
///
/// Rows returned by `get_records` only include ids that still exist.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn get_records(
        &self,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> Result<Vec<Row>, RepositoryError>;

    async fn list_record_ids(&self, table_id: &TableId) -> Result<Vec<RecordId>, RepositoryError>;

    /// Records of `table_id` whose `link_field_id` cell links to any of `targets`.
    async fn find_linking_records(
        &self,
        table_id: &TableId,
        link_field_id: &FieldId,
        targets: &[RecordId],
    ) -> Result<Vec<RecordId>, RepositoryError>;

    /// Persist computed values in one transaction.
    async fn write_computed_values(
        &self,
        table_id: &TableId,
        updates: &[CellUpdate],
    ) -> Result<(), RepositoryError>;

    async fn list_fields_and_links(
        &self,
        base_id: &BaseId,
    ) -> Result<(Vec<FieldDefinition>, Vec<LinkDefinition>), RepositoryError>;
}

/// Receives committed changes for the realtime layer.
pub trait ChangeSink: Send + Sync {
    fn publish(&self, collection: &str, document_id: &str, changes: &[Change]);
}

/// Typed notifications about task processing.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PlanCompiled(PlanTrace),
    TaskCompleted {
        task_id: TaskId,
        updated_cells: usize,
        cell_errors: usize,
    },
    TaskFailed {
        task_id: TaskId,
        attempts: u32,
        permanent: bool,
        error: String,
    },
}

/// A registered observer of [`EngineEvent`]s.
pub trait EngineEventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Collects every event; used by tests and diagnostics.
#[derive(Debug, Default, Clone)]
pub struct RecordingEventHandler {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Every plan trace recorded so far.
    pub fn plans(&self) -> Vec<PlanTrace> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EngineEvent::PlanCompiled(trace) => Some(trace.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EngineEventHandler for RecordingEventHandler {
    fn handle(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}
