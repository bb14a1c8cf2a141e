//! Per-process cache of dependency graphs.
//!
//! The index is read-mostly: it changes only when a field or link is
//! created, edited or removed. Each base's graph is built once, shared as an
//! `Arc`, and dropped by [`GraphCache::invalidate`] on schema change.

use std::sync::Arc;

use dashmap::DashMap;

use super::index::DependencyGraph;
use crate::error::RepositoryError;
use crate::ids::BaseId;
use crate::ports::RecordRepository;

#[derive(Debug, Default)]
pub struct GraphCache {
    graphs: DashMap<BaseId, Arc<DependencyGraph>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached graph for `base_id`, loading it from the repository on a miss.
    pub async fn get_or_load(
        &self,
        base_id: &BaseId,
        repository: &dyn RecordRepository,
    ) -> Result<Arc<DependencyGraph>, RepositoryError> {
        if let Some(graph) = self.graphs.get(base_id) {
            return Ok(Arc::clone(graph.value()));
        }

        let (fields, links) = repository.list_fields_and_links(base_id).await?;
        let graph = Arc::new(DependencyGraph::build(&fields, &links));
        tracing::debug!(
            base_id = %base_id,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "dependency graph loaded"
        );

        // Two loaders racing both build; the first insert wins.
        let entry = self
            .graphs
            .entry(base_id.clone())
            .or_insert_with(|| Arc::clone(&graph));
        Ok(Arc::clone(entry.value()))
    }

    /// Drop the cached graph after a schema change.
    pub fn invalidate(&self, base_id: &BaseId) {
        if self.graphs.remove(base_id).is_some() {
            tracing::debug!(base_id = %base_id, "dependency graph invalidated");
        }
    }

    pub fn is_cached(&self, base_id: &BaseId) -> bool {
        self.graphs.contains_key(base_id)
    }
}
