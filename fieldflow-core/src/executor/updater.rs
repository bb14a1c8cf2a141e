//! Computed Field Updater
//!
//! Walks a compiled plan batch by batch. Each same-table batch loads the
//! affected rows of its table once into a working copy, evaluates its steps
//! in ascending level order (later levels read the values earlier levels
//! just produced), then persists every cell in chunked transactional writes
//! before the next batch starts. Nothing runs across levels in parallel;
//! the fields of a single step are independent and are evaluated together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::join_all;
use indexmap::IndexMap;
use tracing::{debug, warn};

use super::affected::AffectedRecords;
use crate::error::ExecutorError;
use crate::graph::{DependencyGraph, FieldDefinition, FieldKind, FieldNode};
use crate::ids::{FieldId, RecordId, TableId};
use crate::plan::{ComputedSeed, ExecutionPlan, PlanStep, SameTableBatch};
use crate::ports::{
    CellUpdate, CellValue, ChangeSink, ComputedError, Evaluator, RecordContext, RecordRepository,
    Row,
};
use crate::realtime::{record_collection, Change};

/// Default upper bound on cell updates per write.
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 500;

/// Error code stored in cells of fields whose references no longer resolve.
pub const DANGLING_REFERENCE: &str = "DANGLING_REFERENCE";

/// Outcome of executing one plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub plan: ExecutionPlan,
    /// Cells written, error cells included.
    pub updated_cells: usize,
    pub cell_errors: usize,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    updated_cells: usize,
    cell_errors: usize,
}

type WorkingRows = IndexMap<RecordId, Row>;

pub struct ComputedFieldUpdater {
    repository: Arc<dyn RecordRepository>,
    evaluator: Arc<dyn Evaluator>,
    sink: Option<Arc<dyn ChangeSink>>,
    write_chunk_size: usize,
}

impl ComputedFieldUpdater {
    pub fn new(repository: Arc<dyn RecordRepository>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            repository,
            evaluator,
            sink: None,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
        }
    }

    /// Publish committed values to `sink`.
    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_write_chunk_size(mut self, chunk: usize) -> Self {
        self.write_chunk_size = chunk.max(1);
        self
    }

    /// Execute `plan`, compiled from `seed` against `graph`.
    ///
    /// A repository failure aborts the whole plan; batches already committed
    /// stay committed and are recomputed from scratch on retry.
    pub async fn execute(
        &self,
        graph: &DependencyGraph,
        seed: &ComputedSeed,
        plan: ExecutionPlan,
    ) -> Result<ExecutionReport, ExecutorError> {
        let mut report = ExecutionReport {
            plan,
            updated_cells: 0,
            cell_errors: 0,
        };
        if report.plan.is_empty() {
            return Ok(report);
        }

        let affected = AffectedRecords::resolve(self.repository.as_ref(), seed, &report.plan).await?;

        for (batch, steps) in report.plan.batches() {
            let outcome = self.run_batch(graph, &affected, batch, steps).await?;
            report.updated_cells += outcome.updated_cells;
            report.cell_errors += outcome.cell_errors;
        }

        Ok(report)
    }

    async fn run_batch(
        &self,
        graph: &DependencyGraph,
        affected: &AffectedRecords,
        batch: &SameTableBatch,
        steps: &[PlanStep],
    ) -> Result<BatchOutcome, ExecutorError> {
        let table_id = &batch.table_id;
        let ids: BTreeSet<RecordId> = steps
            .iter()
            .flat_map(|s| s.field_ids.iter())
            .flat_map(|f| affected.of(&FieldNode::new(table_id.clone(), f.clone())).iter().cloned())
            .collect();
        if ids.is_empty() {
            debug!(table_id = %table_id, "no affected records in batch");
            return Ok(BatchOutcome::default());
        }

        let ids: Vec<RecordId> = ids.into_iter().collect();
        let mut working: WorkingRows = self
            .repository
            .get_records(table_id, &ids)
            .await?
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();

        let mut outcome = BatchOutcome::default();
        let mut pending: Vec<CellUpdate> = Vec::new();

        for step in steps {
            let evaluated = join_all(
                step.field_ids
                    .iter()
                    .map(|f| self.evaluate_field(graph, affected, &working, table_id, f)),
            )
            .await;

            for updates in evaluated {
                for update in updates? {
                    if let CellValue::Error(e) = &update.value {
                        outcome.cell_errors += 1;
                        warn!(
                            table_id = %table_id,
                            record_id = %update.record_id,
                            field_id = %update.field_id,
                            code = %e.code,
                            message = %e.message,
                            "computed cell evaluation failed"
                        );
                    }
                    if let Some(row) = working.get_mut(&update.record_id) {
                        row.fields.insert(update.field_id.clone(), update.value.to_json());
                    }
                    pending.push(update);
                }
            }
        }

        for chunk in pending.chunks(self.write_chunk_size) {
            self.repository.write_computed_values(table_id, chunk).await?;
            self.publish(table_id, chunk);
        }
        outcome.updated_cells = pending.len();

        debug!(
            table_id = %table_id,
            steps = batch.step_count,
            records = working.len(),
            cells = outcome.updated_cells,
            "batch committed"
        );
        Ok(outcome)
    }

    async fn evaluate_field(
        &self,
        graph: &DependencyGraph,
        affected: &AffectedRecords,
        working: &WorkingRows,
        table_id: &TableId,
        field_id: &FieldId,
    ) -> Result<Vec<CellUpdate>, ExecutorError> {
        let node = FieldNode::new(table_id.clone(), field_id.clone());
        let definition = graph
            .lookup(&node)
            .map_err(|e| ExecutorError::Invariant(format!("planned field {node} not in graph: {e}")))?;

        let rows: Vec<&Row> = affected
            .of(&node)
            .iter()
            .filter_map(|id| working.get(id))
            .collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let cell = |row: &Row, value: CellValue| CellUpdate {
            record_id: row.id.clone(),
            field_id: field_id.clone(),
            value,
        };

        if graph.is_unresolved(&node) {
            let error = ComputedError::new(
                DANGLING_REFERENCE,
                format!("{node} references a field or table that no longer exists"),
            );
            return Ok(rows
                .iter()
                .map(|row| cell(*row, CellValue::Error(error.clone())))
                .collect());
        }

        let contexts = self.contexts(graph, definition, table_id, &rows, working).await?;
        let results = self.evaluator.evaluate_batch(definition, &contexts).await;
        if results.len() != contexts.len() {
            return Err(ExecutorError::Invariant(format!(
                "evaluator returned {} results for {} records of {node}",
                results.len(),
                contexts.len()
            )));
        }

        Ok(rows
            .iter()
            .zip(results)
            .map(|(row, result)| cell(*row, CellValue::from(result)))
            .collect())
    }

    /// Build evaluation contexts, prefetching the foreign rows the field reads.
    async fn contexts(
        &self,
        graph: &DependencyGraph,
        definition: &FieldDefinition,
        table_id: &TableId,
        rows: &[&Row],
        working: &WorkingRows,
    ) -> Result<Vec<RecordContext>, ExecutorError> {
        let mut contexts: Vec<RecordContext> = rows
            .iter()
            .map(|row| RecordContext::new(table_id.clone(), (*row).clone()))
            .collect();

        match &definition.kind {
            FieldKind::Lookup { link_field_id, .. } | FieldKind::Rollup { link_field_id, .. } => {
                let link_node = FieldNode::new(table_id.clone(), link_field_id.clone());
                let foreign_table = graph
                    .link(&link_node)
                    .map(|l| l.foreign_table_id.clone())
                    .ok_or_else(|| {
                        ExecutorError::Invariant(format!("{link_node} is not a link field"))
                    })?;

                let wanted: BTreeSet<RecordId> = rows
                    .iter()
                    .flat_map(|row| row.linked_ids(link_field_id))
                    .collect();
                let foreign = self.load_rows(&foreign_table, table_id, wanted, working).await?;

                for ctx in &mut contexts {
                    let linked = ctx
                        .record
                        .linked_ids(link_field_id)
                        .iter()
                        .filter_map(|id| foreign.get(id).cloned())
                        .collect();
                    ctx.linked.insert(link_field_id.clone(), linked);
                }
            }
            FieldKind::ConditionalRollup {
                foreign_table_id, ..
            } => {
                let ids: BTreeSet<RecordId> = self
                    .repository
                    .list_record_ids(foreign_table_id)
                    .await?
                    .into_iter()
                    .collect();
                let scanned: Arc<[Row]> = self
                    .load_rows(foreign_table_id, table_id, ids, working)
                    .await?
                    .into_values()
                    .collect();
                for ctx in &mut contexts {
                    ctx.scanned.insert(foreign_table_id.clone(), Arc::clone(&scanned));
                }
            }
            FieldKind::Formula { .. } | FieldKind::Plain | FieldKind::Link => {}
        }

        Ok(contexts)
    }

    /// Fetch rows of `foreign_table`, preferring the working copy when the
    /// foreign table is the batch table itself.
    async fn load_rows(
        &self,
        foreign_table: &TableId,
        batch_table: &TableId,
        ids: BTreeSet<RecordId>,
        working: &WorkingRows,
    ) -> Result<BTreeMap<RecordId, Row>, ExecutorError> {
        let mut found = BTreeMap::new();
        let mut missing = Vec::new();
        for id in ids {
            match working.get(&id).filter(|_| foreign_table == batch_table) {
                Some(row) => {
                    found.insert(id, row.clone());
                }
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            for row in self.repository.get_records(foreign_table, &missing).await? {
                found.insert(row.id.clone(), row);
            }
        }
        Ok(found)
    }

    fn publish(&self, table_id: &TableId, updates: &[CellUpdate]) {
        let Some(sink) = &self.sink else {
            return;
        };
        let collection = record_collection(table_id);
        for update in updates {
            sink.publish(
                &collection,
                update.record_id.as_str(),
                &[Change::set([update.field_id.as_str()], update.value.to_json())],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::graph::LinkDefinition;
    use crate::memory::InMemoryRecordStore;
    use crate::plan::{ChangeType, PlanCompiler};
    use crate::realtime::{document_channel, OtOp, RealtimeHub};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Formulas sum their references (`"fail"` errors), rollups sum the
    /// linked values, conditional rollups count the scanned rows.
    struct SumEvaluator;

    fn number(v: Option<&Value>) -> f64 {
        v.and_then(Value::as_f64).unwrap_or(0.0)
    }

    #[async_trait]
    impl Evaluator for SumEvaluator {
        async fn evaluate(
            &self,
            field: &FieldDefinition,
            ctx: &RecordContext,
        ) -> Result<Value, ComputedError> {
            match &field.kind {
                FieldKind::Formula { expression, .. } if expression == "fail" => {
                    Err(ComputedError::new("BOOM", "formula failed"))
                }
                FieldKind::Formula { references, .. } => Ok(json!(references
                    .iter()
                    .map(|r| number(ctx.record.get(r)))
                    .sum::<f64>())),
                FieldKind::Rollup {
                    link_field_id,
                    foreign_field_id,
                    ..
                } => Ok(json!(ctx
                    .linked
                    .get(link_field_id)
                    .map(|rows| rows.iter().map(|r| number(r.get(foreign_field_id))).sum::<f64>())
                    .unwrap_or(0.0))),
                FieldKind::ConditionalRollup {
                    foreign_table_id, ..
                } => Ok(json!(ctx.scanned.get(foreign_table_id).map(|r| r.len()).unwrap_or(0))),
                _ => Ok(Value::Null),
            }
        }
    }

    fn formula(table: &str, field: &str, refs: &[&str], expression: &str) -> FieldDefinition {
        FieldDefinition::new(
            table,
            field,
            field,
            FieldKind::Formula {
                references: refs.iter().map(|r| (*r).into()).collect(),
                expression: expression.into(),
            },
        )
    }

    fn updater(store: &Arc<InMemoryRecordStore>) -> ComputedFieldUpdater {
        ComputedFieldUpdater::new(store.clone(), Arc::new(SumEvaluator))
    }

    async fn run(
        updater: &ComputedFieldUpdater,
        graph: &DependencyGraph,
        seed: &ComputedSeed,
    ) -> Result<ExecutionReport, ExecutorError> {
        let plan = PlanCompiler::new(graph).compile(seed).unwrap();
        updater.execute(graph, seed, plan).await
    }

    fn update(table: &str, record: &str, fields: &[&str]) -> ComputedSeed {
        ComputedSeed::records("bse", table, ChangeType::Update, vec![record.into()])
            .with_fields(fields.iter().map(|f| FieldId::new(*f)))
    }

    #[tokio::test]
    async fn later_levels_read_earlier_levels_within_a_batch() {
        let graph = DependencyGraph::build(
            &[
                FieldDefinition::new("t", "a", "a", FieldKind::Plain),
                formula("t", "b", &["a"], ""),
                formula("t", "c", &["a", "b"], ""),
            ],
            &[],
        );
        let store = Arc::new(InMemoryRecordStore::new());
        store.insert_row("t", Row::new("rec1").with("a", json!(2)));

        let report = run(&updater(&store), &graph, &update("t", "rec1", &["a"]))
            .await
            .unwrap();

        assert_eq!(report.updated_cells, 2);
        assert_eq!(store.write_count(), 1);
        let table = TableId::new("t");
        assert_eq!(store.value(&table, &"rec1".into(), &"c".into()), Some(json!(4.0)));
    }

    #[tokio::test]
    async fn rollup_commits_and_publishes() {
        let graph = DependencyGraph::build(
            &[
                FieldDefinition::new("tblOrders", "fldPrice", "Price", FieldKind::Plain),
                FieldDefinition::new("tblCustomers", "fldOrders", "Orders", FieldKind::Link),
                FieldDefinition::new(
                    "tblCustomers",
                    "fldTotal",
                    "Total",
                    FieldKind::Rollup {
                        link_field_id: "fldOrders".into(),
                        foreign_field_id: "fldPrice".into(),
                        aggregation: "sum".into(),
                    },
                ),
            ],
            &[LinkDefinition::new("tblCustomers", "fldOrders", "tblOrders")],
        );
        let store = Arc::new(InMemoryRecordStore::new());
        store.insert_row("tblOrders", Row::new("recO1").with("fldPrice", json!(20)));
        store.insert_row("tblOrders", Row::new("recO2").with("fldPrice", json!(5)));
        store.insert_row(
            "tblCustomers",
            Row::new("recC1").with("fldOrders", json!(["recO1", "recO2"])),
        );

        let hub = RealtimeHub::new();
        let mut sub = hub.subscribe(document_channel("rec_tblCustomers", "recC1"));
        let updater = updater(&store).with_change_sink(Arc::new(hub.clone()));

        run(&updater, &graph, &update("tblOrders", "recO1", &["fldPrice"]))
            .await
            .unwrap();

        assert_eq!(
            store.value(&"tblCustomers".into(), &"recC1".into(), &"fldTotal".into()),
            Some(json!(25.0))
        );
        let ops = sub.drain();
        assert_eq!(
            ops,
            vec![OtOp::ObjectReplace {
                path: vec!["fldTotal".into()],
                value: json!(25.0),
            }]
        );
    }

    #[tokio::test]
    async fn cell_errors_do_not_abort_the_batch() {
        let graph = DependencyGraph::build(
            &[
                FieldDefinition::new("t", "a", "a", FieldKind::Plain),
                formula("t", "bad", &["a"], "fail"),
                formula("t", "good", &["a"], ""),
            ],
            &[],
        );
        let store = Arc::new(InMemoryRecordStore::new());
        store.insert_row("t", Row::new("rec1").with("a", json!(7)));

        let report = run(&updater(&store), &graph, &update("t", "rec1", &["a"]))
            .await
            .unwrap();

        assert_eq!(report.cell_errors, 1);
        assert_eq!(report.updated_cells, 2);
        let table = TableId::new("t");
        assert_eq!(store.value(&table, &"rec1".into(), &"good".into()), Some(json!(7.0)));
        assert_eq!(
            store.value(&table, &"rec1".into(), &"bad".into()),
            Some(json!({ "error": { "code": "BOOM", "message": "formula failed" } }))
        );
    }

    #[tokio::test]
    async fn write_failure_aborts_the_plan() {
        let graph = DependencyGraph::build(
            &[
                FieldDefinition::new("t", "a", "a", FieldKind::Plain),
                formula("t", "b", &["a"], ""),
            ],
            &[],
        );
        let store = Arc::new(InMemoryRecordStore::new());
        store.insert_row("t", Row::new("rec1").with("a", json!(1)));
        store.fail_next_write(RepositoryError::transient("connection reset"));

        let err = run(&updater(&store), &graph, &update("t", "rec1", &["a"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecutorError::Repository(RepositoryError::transient("connection reset"))
        );
        assert_eq!(store.value(&"t".into(), &"rec1".into(), &"b".into()), None);
    }

    #[tokio::test]
    async fn backfill_writes_in_chunks() {
        let graph = DependencyGraph::build(
            &[
                FieldDefinition::new("t", "a", "a", FieldKind::Plain),
                formula("t", "b", &["a"], ""),
            ],
            &[],
        );
        let store = Arc::new(InMemoryRecordStore::new());
        for i in 0..5 {
            store.insert_row("t", Row::new(format!("rec{i}")).with("a", json!(i)));
        }

        let seed = ComputedSeed::backfill("bse", "t", vec!["b".into()]);
        let report = run(&updater(&store).with_write_chunk_size(2), &graph, &seed)
            .await
            .unwrap();

        assert_eq!(report.updated_cells, 5);
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn dangling_field_gets_error_cells() {
        let graph = DependencyGraph::build(&[formula("t", "b", &["gone"], "")], &[]);
        let store = Arc::new(InMemoryRecordStore::new());
        store.insert_row("t", Row::new("rec1"));

        let seed = ComputedSeed::backfill("bse", "t", vec!["b".into()]);
        let report = run(&updater(&store), &graph, &seed).await.unwrap();

        assert_eq!(report.cell_errors, 1);
        let value = store.value(&"t".into(), &"rec1".into(), &"b".into()).unwrap();
        assert_eq!(value["error"]["code"], DANGLING_REFERENCE);
    }

    #[tokio::test]
    async fn conditional_rollup_scans_foreign_table() {
        let graph = DependencyGraph::build(
            &[
                FieldDefinition::new("tblTasks", "fldDone", "Done", FieldKind::Plain),
                FieldDefinition::new(
                    "tblProjects",
                    "fldOpen",
                    "Open tasks",
                    FieldKind::ConditionalRollup {
                        foreign_table_id: "tblTasks".into(),
                        foreign_field_id: "fldDone".into(),
                        filter_field_ids: Vec::new(),
                        aggregation: "count".into(),
                    },
                ),
            ],
            &[],
        );
        let store = Arc::new(InMemoryRecordStore::new());
        for id in ["recT1", "recT2", "recT3"] {
            store.insert_row("tblTasks", Row::new(id).with("fldDone", json!(false)));
        }
        store.insert_row("tblProjects", Row::new("recP1"));
        store.insert_row("tblProjects", Row::new("recP2"));

        let report = run(&updater(&store), &graph, &update("tblTasks", "recT1", &["fldDone"]))
            .await
            .unwrap();

        assert_eq!(report.updated_cells, 2);
        assert_eq!(
            store.value(&"tblProjects".into(), &"recP2".into(), &"fldOpen".into()),
            Some(json!(3))
        );
    }
}
