//! Affected-record resolution.
//!
//! For every node in a plan, which records of its table must be recomputed.
//! Nodes are resolved in ascending level order so each edge's source set is
//! known before its target is resolved.

use std::collections::{BTreeSet, HashMap};

use crate::error::RepositoryError;
use crate::graph::{EdgeKind, FieldNode};
use crate::ids::{FieldId, RecordId, TableId};
use crate::plan::{ComputedSeed, ExecutionPlan};
use crate::ports::RecordRepository;

static NONE: BTreeSet<RecordId> = BTreeSet::new();

#[derive(Debug, Default)]
pub(crate) struct AffectedRecords {
    by_node: HashMap<FieldNode, BTreeSet<RecordId>>,
    whole_tables: HashMap<TableId, Vec<RecordId>>,
    linking: HashMap<(TableId, FieldId, Vec<RecordId>), Vec<RecordId>>,
}

impl AffectedRecords {
    pub(crate) async fn resolve(
        repository: &dyn RecordRepository,
        seed: &ComputedSeed,
        plan: &ExecutionPlan,
    ) -> Result<Self, RepositoryError> {
        let mut affected = Self::default();

        for (node, _) in plan.nodes_by_level() {
            let mut records = BTreeSet::new();

            if is_seed_node(seed, node) {
                if seed.backfill {
                    records.extend(affected.whole_table(repository, &node.table_id).await?);
                } else {
                    records.extend(seed.record_ids.iter().cloned());
                }
            }

            for edge in plan.edges_into(node) {
                let sources: Vec<RecordId> = affected.of(&edge.from).iter().cloned().collect();
                match edge.kind {
                    EdgeKind::Direct => records.extend(sources),
                    EdgeKind::ViaLink => {
                        let Some(link_field_id) = &edge.link_field_id else {
                            continue;
                        };
                        if !sources.is_empty() {
                            records.extend(
                                affected
                                    .linking_records(repository, &node.table_id, link_field_id, sources)
                                    .await?,
                            );
                        }
                        // Deleted seed rows can no longer be followed; use the snapshot.
                        if edge.from.table_id == seed.table_id {
                            if let Some(snapshot) = seed.link_snapshot.get(link_field_id) {
                                records.extend(snapshot.iter().cloned());
                            }
                        }
                    }
                    EdgeKind::Conditional => {
                        records.extend(affected.whole_table(repository, &node.table_id).await?);
                    }
                }
            }

            affected.by_node.insert(node.clone(), records);
        }

        Ok(affected)
    }

    pub(crate) fn of(&self, node: &FieldNode) -> &BTreeSet<RecordId> {
        self.by_node.get(node).unwrap_or(&NONE)
    }

    async fn whole_table(
        &mut self,
        repository: &dyn RecordRepository,
        table_id: &TableId,
    ) -> Result<Vec<RecordId>, RepositoryError> {
        if let Some(ids) = self.whole_tables.get(table_id) {
            return Ok(ids.clone());
        }
        let ids = repository.list_record_ids(table_id).await?;
        self.whole_tables.insert(table_id.clone(), ids.clone());
        Ok(ids)
    }

    async fn linking_records(
        &mut self,
        repository: &dyn RecordRepository,
        table_id: &TableId,
        link_field_id: &FieldId,
        targets: Vec<RecordId>,
    ) -> Result<Vec<RecordId>, RepositoryError> {
        let key = (table_id.clone(), link_field_id.clone(), targets);
        if let Some(ids) = self.linking.get(&key) {
            return Ok(ids.clone());
        }
        let ids = repository
            .find_linking_records(table_id, link_field_id, &key.2)
            .await?;
        self.linking.insert(key, ids.clone());
        Ok(ids)
    }
}

fn is_seed_node(seed: &ComputedSeed, node: &FieldNode) -> bool {
    node.table_id == seed.table_id
        && (seed.field_ids.is_empty() || seed.field_ids.contains(&node.field_id))
}
