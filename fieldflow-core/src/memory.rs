//! In-memory record store.
//!
//! A [`RecordRepository`] backed by process memory, used by tests, demos and
//! benches. Writes can be made to fail on demand to exercise retry paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::RepositoryError;
use crate::graph::{FieldDefinition, LinkDefinition};
use crate::ids::{BaseId, FieldId, RecordId, TableId};
use crate::ports::{CellUpdate, RecordRepository, Row};

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: DashMap<TableId, IndexMap<RecordId, Row>>,
    schemas: RwLock<HashMap<BaseId, (Vec<FieldDefinition>, Vec<LinkDefinition>)>>,
    failing_writes: Mutex<VecDeque<RepositoryError>>,
    calls: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the field and link definitions of a base.
    pub fn define_schema(
        &self,
        base_id: impl Into<BaseId>,
        fields: Vec<FieldDefinition>,
        links: Vec<LinkDefinition>,
    ) {
        self.schemas.write().insert(base_id.into(), (fields, links));
    }

    /// Insert or replace a row.
    pub fn insert_row(&self, table_id: impl Into<TableId>, row: Row) {
        self.tables
            .entry(table_id.into())
            .or_default()
            .insert(row.id.clone(), row);
    }

    /// Set one cell; returns `false` if the row does not exist.
    pub fn set_cell(
        &self,
        table_id: &TableId,
        record_id: &RecordId,
        field_id: impl Into<FieldId>,
        value: Value,
    ) -> bool {
        let Some(mut table) = self.tables.get_mut(table_id) else {
            return false;
        };
        match table.get_mut(record_id) {
            Some(row) => {
                row.fields.insert(field_id.into(), value);
                true
            }
            None => false,
        }
    }

    pub fn delete_row(&self, table_id: &TableId, record_id: &RecordId) -> Option<Row> {
        self.tables.get_mut(table_id)?.shift_remove(record_id)
    }

    pub fn row(&self, table_id: &TableId, record_id: &RecordId) -> Option<Row> {
        self.tables.get(table_id)?.get(record_id).cloned()
    }

    pub fn value(&self, table_id: &TableId, record_id: &RecordId, field_id: &FieldId) -> Option<Value> {
        self.tables
            .get(table_id)?
            .get(record_id)?
            .get(field_id)
            .cloned()
    }

    /// Make the next `write_computed_values` call fail with `error`.
    pub fn fail_next_write(&self, error: RepositoryError) {
        self.failing_writes.lock().push_back(error);
    }

    /// Number of repository calls of any kind.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of committed `write_computed_values` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordRepository for InMemoryRecordStore {
    async fn get_records(
        &self,
        table_id: &TableId,
        ids: &[RecordId],
    ) -> Result<Vec<Row>, RepositoryError> {
        self.touch();
        let Some(table) = self.tables.get(table_id) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| table.get(id).cloned()).collect())
    }

    async fn list_record_ids(&self, table_id: &TableId) -> Result<Vec<RecordId>, RepositoryError> {
        self.touch();
        Ok(self
            .tables
            .get(table_id)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_linking_records(
        &self,
        table_id: &TableId,
        link_field_id: &FieldId,
        targets: &[RecordId],
    ) -> Result<Vec<RecordId>, RepositoryError> {
        self.touch();
        let targets: HashSet<&RecordId> = targets.iter().collect();
        let Some(table) = self.tables.get(table_id) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|row| {
                row.linked_ids(link_field_id)
                    .iter()
                    .any(|id| targets.contains(id))
            })
            .map(|row| row.id.clone())
            .collect())
    }

    async fn write_computed_values(
        &self,
        table_id: &TableId,
        updates: &[CellUpdate],
    ) -> Result<(), RepositoryError> {
        self.touch();
        if let Some(error) = self.failing_writes.lock().pop_front() {
            return Err(error);
        }

        // Rows deleted since they were read are skipped.
        if let Some(mut table) = self.tables.get_mut(table_id) {
            for update in updates {
                if let Some(row) = table.get_mut(&update.record_id) {
                    row.fields
                        .insert(update.field_id.clone(), update.value.to_json());
                }
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_fields_and_links(
        &self,
        base_id: &BaseId,
    ) -> Result<(Vec<FieldDefinition>, Vec<LinkDefinition>), RepositoryError> {
        self.touch();
        Ok(self.schemas.read().get(base_id).cloned().unwrap_or_default())
    }
}
