//! Plan data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::{EdgeKind, FieldNode};
use crate::ids::{BaseId, FieldId, RecordId, TableId};

/// What happened to the seed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    /// Lowercase name, as it appears in plan traces.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// "A change happened": the payload the write path enqueues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedSeed {
    pub base_id: BaseId,
    pub table_id: TableId,
    pub record_ids: Vec<RecordId>,
    /// Fields that changed. Empty means every field of the table.
    #[serde(default)]
    pub field_ids: Vec<FieldId>,
    pub change_type: ChangeType,
    /// Recompute `field_ids` themselves over the whole table (a computed
    /// field was created or its definition edited).
    #[serde(default)]
    pub backfill: bool,
    /// Link field (in another table) -> records of that table that linked to
    /// the seed records when the write happened. Deleted rows can no longer
    /// be followed, so deletes carry their former neighbours here.
    #[serde(default)]
    pub link_snapshot: BTreeMap<FieldId, Vec<RecordId>>,
}

impl ComputedSeed {
    /// A record change.
    pub fn records(
        base_id: impl Into<BaseId>,
        table_id: impl Into<TableId>,
        change_type: ChangeType,
        record_ids: impl IntoIterator<Item = RecordId>,
    ) -> Self {
        Self {
            base_id: base_id.into(),
            table_id: table_id.into(),
            record_ids: record_ids.into_iter().collect(),
            field_ids: Vec::new(),
            change_type,
            backfill: false,
            link_snapshot: BTreeMap::new(),
        }
    }

    /// Recompute the given computed fields for every record of the table.
    pub fn backfill(
        base_id: impl Into<BaseId>,
        table_id: impl Into<TableId>,
        field_ids: impl IntoIterator<Item = FieldId>,
    ) -> Self {
        Self {
            base_id: base_id.into(),
            table_id: table_id.into(),
            record_ids: Vec::new(),
            field_ids: field_ids.into_iter().collect(),
            change_type: ChangeType::Update,
            backfill: true,
            link_snapshot: BTreeMap::new(),
        }
    }

    /// Restrict the seed to the fields that changed.
    pub fn with_fields(mut self, field_ids: impl IntoIterator<Item = FieldId>) -> Self {
        self.field_ids = field_ids.into_iter().collect();
        self
    }

    /// Remember which records of another table linked to the seed records.
    pub fn with_link_snapshot(
        mut self,
        link_field_id: impl Into<FieldId>,
        record_ids: impl IntoIterator<Item = RecordId>,
    ) -> Self {
        self.link_snapshot
            .entry(link_field_id.into())
            .or_default()
            .extend(record_ids);
        self
    }

    /// Whether the seed cannot affect anything: a record change with no records.
    pub fn is_noop(&self) -> bool {
        !self.backfill && self.record_ids.is_empty()
    }
}

/// All fields of one table computed at one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub table_id: TableId,
    pub level: u32,
    pub field_ids: Vec<FieldId>,
}

/// An edge traversed while compiling the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEdge {
    pub from: FieldNode,
    pub to: FieldNode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_field_id: Option<FieldId>,
    #[serde(skip)]
    pub kind: EdgeKind,
    /// Discovery index.
    pub order: usize,
}

/// A run of adjacent steps on the same table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SameTableBatch {
    pub table_id: TableId,
    pub step_count: usize,
    pub min_level: u32,
    pub max_level: u32,
    pub field_count: usize,
}

/// The ordered work for one seed change. Built once by the compiler and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    base_id: BaseId,
    seed_table_id: TableId,
    seed_record_ids: Vec<RecordId>,
    change_type: ChangeType,
    steps: Vec<PlanStep>,
    edges: Vec<PlanEdge>,
    same_table_batches: Vec<SameTableBatch>,
    #[serde(skip)]
    levels: BTreeMap<FieldNode, u32>,
}

impl ExecutionPlan {
    pub(crate) fn new(
        seed: &ComputedSeed,
        steps: Vec<PlanStep>,
        edges: Vec<PlanEdge>,
        levels: BTreeMap<FieldNode, u32>,
    ) -> Self {
        let same_table_batches = coalesce(&steps);
        Self {
            base_id: seed.base_id.clone(),
            seed_table_id: seed.table_id.clone(),
            seed_record_ids: seed.record_ids.clone(),
            change_type: seed.change_type,
            steps,
            edges,
            same_table_batches,
            levels,
        }
    }

    /// The zero-step plan.
    pub fn empty(seed: &ComputedSeed) -> Self {
        Self::new(seed, Vec::new(), Vec::new(), BTreeMap::new())
    }

    /// Base the seed belongs to.
    pub fn base_id(&self) -> &BaseId {
        &self.base_id
    }

    /// Table whose records changed.
    pub fn seed_table_id(&self) -> &TableId {
        &self.seed_table_id
    }

    /// Records that changed, as enqueued.
    pub fn seed_record_ids(&self) -> &[RecordId] {
        &self.seed_record_ids
    }

    /// Insert, update or delete of the seed records.
    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    /// Steps in execution order: ascending level, one table each.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Every edge traversed while compiling, in discovery order.
    pub fn edges(&self) -> &[PlanEdge] {
        &self.edges
    }

    /// Adjacent same-table steps merged; the executor commits one batch at a
    /// time.
    pub fn same_table_batches(&self) -> &[SameTableBatch] {
        &self.same_table_batches
    }

    /// No computed field needs recomputing.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Level assigned to a node, including non-computed seed nodes (level 0).
    pub fn level_of(&self, node: &FieldNode) -> Option<u32> {
        self.levels.get(node).copied()
    }

    /// Every node reached by the plan, seeds included, in ascending level
    /// order (ties broken by node).
    pub fn nodes_by_level(&self) -> Vec<(&FieldNode, u32)> {
        let mut nodes: Vec<(&FieldNode, u32)> = self.levels.iter().map(|(n, l)| (n, *l)).collect();
        nodes.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
        nodes
    }

    /// Plan edges ending at `node`.
    pub fn edges_into<'a>(&'a self, node: &'a FieldNode) -> impl Iterator<Item = &'a PlanEdge> + 'a {
        self.edges.iter().filter(move |e| &e.to == node)
    }

    /// Each same-table batch with the steps it covers.
    pub fn batches(&self) -> impl Iterator<Item = (&SameTableBatch, &[PlanStep])> {
        let mut offset = 0;
        self.same_table_batches.iter().map(move |batch| {
            let steps = &self.steps[offset..offset + batch.step_count];
            offset += batch.step_count;
            (batch, steps)
        })
    }

    /// Total number of fields scheduled.
    pub fn field_count(&self) -> usize {
        self.steps.iter().map(|s| s.field_ids.len()).sum()
    }
}

/// Merge adjacent steps that share a table. Adjacency only, so level order
/// across the whole plan is preserved.
fn coalesce(steps: &[PlanStep]) -> Vec<SameTableBatch> {
    let mut batches: Vec<SameTableBatch> = Vec::new();
    for step in steps {
        match batches.last_mut() {
            Some(batch) if batch.table_id == step.table_id => {
                batch.step_count += 1;
                batch.min_level = batch.min_level.min(step.level);
                batch.max_level = batch.max_level.max(step.level);
                batch.field_count += step.field_ids.len();
            }
            _ => batches.push(SameTableBatch {
                table_id: step.table_id.clone(),
                step_count: 1,
                min_level: step.level,
                max_level: step.level,
                field_count: step.field_ids.len(),
            }),
        }
    }
    batches
}
