//! The `computed:plan` trace record.
//!
//! Logged once per task execution with the full plan. Operators read it in
//! the logs; test suites assert against it through
//! [`EngineEvent::PlanCompiled`](crate::ports::EngineEvent::PlanCompiled).

use serde::Serialize;

use super::model::{ChangeType, ExecutionPlan, PlanEdge, PlanStep, SameTableBatch};
use crate::ids::{BaseId, RecordId, TableId};

/// Log target of the plan record.
pub const PLAN_TRACE_TARGET: &str = "computed:plan";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTrace {
    pub base_id: BaseId,
    pub seed_table_id: TableId,
    pub seed_record_ids: Vec<RecordId>,
    pub change_type: ChangeType,
    pub steps: Vec<PlanStep>,
    pub edges: Vec<PlanEdge>,
    pub same_table_batches: Vec<SameTableBatch>,
}

impl From<&ExecutionPlan> for PlanTrace {
    fn from(plan: &ExecutionPlan) -> Self {
        Self {
            base_id: plan.base_id().clone(),
            seed_table_id: plan.seed_table_id().clone(),
            seed_record_ids: plan.seed_record_ids().to_vec(),
            change_type: plan.change_type(),
            steps: plan.steps().to_vec(),
            edges: plan.edges().to_vec(),
            same_table_batches: plan.same_table_batches().to_vec(),
        }
    }
}

impl PlanTrace {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Emit the record.
    pub fn log(&self) {
        tracing::info!(
            target: PLAN_TRACE_TARGET,
            base_id = %self.base_id,
            seed_table_id = %self.seed_table_id,
            change_type = self.change_type.as_str(),
            step_count = self.steps.len(),
            plan = %self.to_json(),
            "computed:plan"
        );
    }
}
