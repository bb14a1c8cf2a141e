//! Dependency Graph Index
//!
//! Answers "which `(table, field)` nodes are computed directly from these
//! nodes" in O(degree). Built once per base from the full list of field and
//! link definitions, then shared read-only.
//!
//! # Dangling references
//!
//! A reference to a table, field or link that no longer exists is a
//! data-integrity condition, not a crash. The index records it, skips the
//! edge, and marks the referencing field unresolved. Traversal never expands
//! out of an unresolved field (fail-open on enumeration); the field itself is
//! still scheduled when reached, and evaluation errors its cells
//! (fail-closed on evaluation).

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use super::node::{
    ComputedField, FieldDefinition, FieldDependencyEdge, FieldKind, FieldNode,
    LinkDefinition,
};
use crate::error::{DefinitionError, GraphError};
use crate::ids::{FieldId, TableId};

/// A reference that could not be resolved while building the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub field: FieldNode,
    pub missing: String,
}

impl From<DanglingReference> for DefinitionError {
    fn from(d: DanglingReference) -> Self {
        DefinitionError::DanglingReference {
            field: d.field,
            missing: d.missing,
        }
    }
}

type EdgeList = SmallVec<[FieldDependencyEdge; 4]>;

/// Adjacency-list index of field dependencies for one base. Maps keep
/// definition order, so edge enumeration is deterministic.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Every known field, by node.
    fields: IndexMap<FieldNode, FieldDefinition>,

    /// Field ids per table, in definition order.
    tables: IndexMap<TableId, Vec<FieldId>>,

    /// Link definitions, keyed by the link field's node.
    links: IndexMap<FieldNode, LinkDefinition>,

    /// Computed view of every computed field.
    computed: IndexMap<FieldNode, ComputedField>,

    /// Outgoing edges: source node -> edges to the nodes computed from it.
    dependents: IndexMap<FieldNode, EdgeList>,

    /// Incoming edges: computed node -> edges from its sources.
    dependencies: IndexMap<FieldNode, EdgeList>,

    /// Computed fields with at least one dangling reference.
    unresolved: IndexSet<FieldNode>,

    dangling: Vec<DanglingReference>,
}

impl DependencyGraph {
    /// Build the index from all field and link definitions of a base.
    pub fn build(fields: &[FieldDefinition], links: &[LinkDefinition]) -> Self {
        let mut graph = Self::default();

        for field in fields {
            graph
                .tables
                .entry(field.table_id.clone())
                .or_default()
                .push(field.field_id.clone());
            graph.fields.insert(field.node(), field.clone());
        }

        for link in links {
            let node = FieldNode::new(link.table_id.clone(), link.field_id.clone());
            graph.links.insert(node, link.clone());
        }

        for field in fields {
            let host = field.table_id.clone();
            let link_target = |link_field: &FieldId| {
                graph
                    .links
                    .get(&FieldNode::new(host.clone(), link_field.clone()))
                    .map(|l| l.foreign_table_id.clone())
            };
            let Some(computed) = field.computed(link_target) else {
                continue;
            };

            let mut missing = graph.missing_references(field);
            for source in &computed.source_refs {
                if !graph.fields.contains_key(&source.node) {
                    missing.push(graph.describe_missing(&source.node));
                }
            }

            let to = field.node();
            if !missing.is_empty() {
                graph.unresolved.insert(to.clone());
                for m in missing {
                    tracing::warn!(field = %to, missing = %m, "dangling computed field reference");
                    graph.dangling.push(DanglingReference {
                        field: to.clone(),
                        missing: m,
                    });
                }
            }

            for source in &computed.source_refs {
                if graph.fields.contains_key(&source.node) {
                    graph.add_edge(FieldDependencyEdge {
                        from: source.node.clone(),
                        to: to.clone(),
                        link_field_id: source.link_field_id.clone(),
                        kind: source.kind,
                    });
                }
            }

            graph.computed.insert(to, computed);
        }

        graph
    }

    /// References that `computed()` cannot express as a source ref: a link
    /// field that is not a link, or a link whose foreign table is gone.
    fn missing_references(&self, field: &FieldDefinition) -> Vec<String> {
        let link_field_id = match &field.kind {
            FieldKind::Lookup { link_field_id, .. } | FieldKind::Rollup { link_field_id, .. } => {
                link_field_id
            }
            _ => return Vec::new(),
        };
        let node = FieldNode::new(field.table_id.clone(), link_field_id.clone());
        match self.links.get(&node) {
            None => vec![format!("link field {node}")],
            Some(link) if !self.tables.contains_key(&link.foreign_table_id) => {
                vec![format!("table {}", link.foreign_table_id)]
            }
            Some(_) => Vec::new(),
        }
    }

    fn describe_missing(&self, node: &FieldNode) -> String {
        if self.tables.contains_key(&node.table_id) {
            format!("field {node}")
        } else {
            format!("table {}", node.table_id)
        }
    }

    fn add_edge(&mut self, edge: FieldDependencyEdge) {
        let outgoing = self.dependents.entry(edge.from.clone()).or_default();
        if outgoing.contains(&edge) {
            return;
        }
        outgoing.push(edge.clone());
        self.dependencies
            .entry(edge.to.clone())
            .or_default()
            .push(edge);
    }

    /// Edges from `node` to the nodes computed directly from it.
    ///
    /// Unresolved fields have no downstream effect.
    pub fn dependents_of(&self, node: &FieldNode) -> &[FieldDependencyEdge] {
        if self.unresolved.contains(node) {
            return &[];
        }
        self.dependents.get(node).map(|e| e.as_slice()).unwrap_or(&[])
    }

    /// Outgoing edges including those of unresolved fields.
    pub(crate) fn raw_dependents_of(&self, node: &FieldNode) -> &[FieldDependencyEdge] {
        self.dependents.get(node).map(|e| e.as_slice()).unwrap_or(&[])
    }

    /// Edges into `node` from its sources.
    pub fn dependencies_of(&self, node: &FieldNode) -> &[FieldDependencyEdge] {
        self.dependencies
            .get(node)
            .map(|e| e.as_slice())
            .unwrap_or(&[])
    }

    /// One-hop expansion of a node set, annotated with the traversed edges.
    ///
    /// Edges are returned in a deterministic order (by source, then target).
    pub fn downstream<'a, I>(&self, nodes: I) -> Vec<&FieldDependencyEdge>
    where
        I: IntoIterator<Item = &'a FieldNode>,
    {
        let mut sources: Vec<&FieldNode> = nodes.into_iter().collect();
        sources.sort();
        sources.dedup();

        let mut edges: Vec<&FieldDependencyEdge> = sources
            .into_iter()
            .flat_map(|n| self.dependents_of(n).iter())
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        edges
    }

    /// Look up a field definition.
    pub fn lookup(&self, node: &FieldNode) -> Result<&FieldDefinition, GraphError> {
        self.fields.get(node).ok_or_else(|| {
            if self.tables.contains_key(&node.table_id) {
                GraphError::UnknownField {
                    table: node.table_id.clone(),
                    field: node.field_id.clone(),
                }
            } else {
                GraphError::UnknownTable(node.table_id.clone())
            }
        })
    }

    /// Field ids of a table, in definition order.
    pub fn table_fields(&self, table_id: &TableId) -> Result<&[FieldId], GraphError> {
        self.tables
            .get(table_id)
            .map(|f| f.as_slice())
            .ok_or_else(|| GraphError::UnknownTable(table_id.clone()))
    }

    /// The link definition for a link field, if `node` is one.
    pub fn link(&self, node: &FieldNode) -> Option<&LinkDefinition> {
        self.links.get(node)
    }

    /// The computed view of a field, if it is computed.
    pub fn computed(&self, node: &FieldNode) -> Option<&ComputedField> {
        self.computed.get(node)
    }

    pub fn is_computed(&self, node: &FieldNode) -> bool {
        self.computed.contains_key(node)
    }

    pub fn is_unresolved(&self, node: &FieldNode) -> bool {
        self.unresolved.contains(node)
    }

    /// Every reference that could not be resolved at build time.
    pub fn dangling(&self) -> &[DanglingReference] {
        &self.dangling
    }

    /// All nodes, in a deterministic order.
    pub fn nodes(&self) -> Vec<&FieldNode> {
        let mut nodes: Vec<&FieldNode> = self.fields.keys().collect();
        nodes.sort();
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.fields.len()
    }

    pub fn edge_count(&self) -> usize {
        self.dependents.values().map(|e| e.len()).sum()
    }
}
