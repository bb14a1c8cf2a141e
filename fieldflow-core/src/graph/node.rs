//! Graph Nodes
//!
//! This module defines the node and edge types that live in the dependency
//! graph, plus the field definitions they are derived from.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ids::{FieldId, TableId};

/// A `(table, field)` pair: one node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldNode {
    pub table_id: TableId,
    pub field_id: FieldId,
}

impl FieldNode {
    pub fn new(table_id: impl Into<TableId>, field_id: impl Into<FieldId>) -> Self {
        Self {
            table_id: table_id.into(),
            field_id: field_id.into(),
        }
    }
}

impl fmt::Display for FieldNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table_id, self.field_id)
    }
}

/// What a field holds and, for computed fields, where its value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldKind {
    /// A user-entered value.
    Plain,

    /// A relationship to records of another table. Details live in the
    /// matching [`LinkDefinition`].
    Link,

    /// An expression over sibling fields of the same table.
    #[serde(rename_all = "camelCase")]
    Formula {
        references: Vec<FieldId>,
        expression: String,
    },

    /// Values of a foreign field, gathered through a link field.
    #[serde(rename_all = "camelCase")]
    Lookup {
        link_field_id: FieldId,
        foreign_field_id: FieldId,
    },

    /// An aggregation of a foreign field, gathered through a link field.
    #[serde(rename_all = "camelCase")]
    Rollup {
        link_field_id: FieldId,
        foreign_field_id: FieldId,
        aggregation: String,
    },

    /// An aggregation over every record of a foreign table matching a filter.
    /// No link field is involved.
    #[serde(rename_all = "camelCase")]
    ConditionalRollup {
        foreign_table_id: TableId,
        foreign_field_id: FieldId,
        filter_field_ids: Vec<FieldId>,
        aggregation: String,
    },
}

/// The definition of one field, as listed by the record repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub table_id: TableId,
    pub field_id: FieldId,
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDefinition {
    pub fn new(
        table_id: impl Into<TableId>,
        field_id: impl Into<FieldId>,
        name: impl Into<String>,
        kind: FieldKind,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            field_id: field_id.into(),
            name: name.into(),
            kind,
        }
    }

    pub fn node(&self) -> FieldNode {
        FieldNode::new(self.table_id.clone(), self.field_id.clone())
    }

    pub fn is_computed(&self) -> bool {
        !matches!(self.kind, FieldKind::Plain | FieldKind::Link)
    }

    /// The computed view of this field, or `None` for plain and link fields.
    ///
    /// `link_target` resolves a link field of this table to its foreign table.
    pub fn computed<F>(&self, link_target: F) -> Option<ComputedField>
    where
        F: Fn(&FieldId) -> Option<TableId>,
    {
        let (kind, source_refs) = match &self.kind {
            FieldKind::Plain | FieldKind::Link => return None,
            FieldKind::Formula { references, .. } => (
                ComputedKind::Formula,
                references
                    .iter()
                    .map(|f| SourceRef::direct(self.table_id.clone(), f.clone()))
                    .collect(),
            ),
            FieldKind::Lookup {
                link_field_id,
                foreign_field_id,
            } => (
                ComputedKind::Lookup,
                self.linked_refs(link_field_id, foreign_field_id, &link_target),
            ),
            FieldKind::Rollup {
                link_field_id,
                foreign_field_id,
                ..
            } => (
                ComputedKind::Rollup,
                self.linked_refs(link_field_id, foreign_field_id, &link_target),
            ),
            FieldKind::ConditionalRollup {
                foreign_table_id,
                foreign_field_id,
                filter_field_ids,
                ..
            } => {
                let mut refs: SmallVec<[SourceRef; 2]> = SmallVec::new();
                refs.push(SourceRef::conditional(
                    foreign_table_id.clone(),
                    foreign_field_id.clone(),
                ));
                for filter in filter_field_ids {
                    refs.push(SourceRef::conditional(foreign_table_id.clone(), filter.clone()));
                }
                (ComputedKind::ConditionalRollup, refs)
            }
        };

        Some(ComputedField {
            table_id: self.table_id.clone(),
            field_id: self.field_id.clone(),
            kind,
            source_refs,
        })
    }

    fn linked_refs<F>(
        &self,
        link_field_id: &FieldId,
        foreign_field_id: &FieldId,
        link_target: &F,
    ) -> SmallVec<[SourceRef; 2]>
    where
        F: Fn(&FieldId) -> Option<TableId>,
    {
        let mut refs = SmallVec::new();
        // Relinking a record changes the gathered values as much as editing them.
        refs.push(SourceRef::direct(self.table_id.clone(), link_field_id.clone()));
        // An unresolvable link leaves only the direct ref; the index reports it.
        if let Some(foreign_table) = link_target(link_field_id) {
            refs.push(SourceRef {
                node: FieldNode {
                    table_id: foreign_table,
                    field_id: foreign_field_id.clone(),
                },
                link_field_id: Some(link_field_id.clone()),
                kind: EdgeKind::ViaLink,
            });
        }
        refs
    }
}

/// A link field: the host table holds the ids of linked foreign records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDefinition {
    pub table_id: TableId,
    pub field_id: FieldId,
    pub foreign_table_id: TableId,
    /// The mirror link field on the foreign table, when the link is two-way.
    pub symmetric_field_id: Option<FieldId>,
}

impl LinkDefinition {
    pub fn new(
        table_id: impl Into<TableId>,
        field_id: impl Into<FieldId>,
        foreign_table_id: impl Into<TableId>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            field_id: field_id.into(),
            foreign_table_id: foreign_table_id.into(),
            symmetric_field_id: None,
        }
    }

    pub fn with_symmetric(mut self, field_id: impl Into<FieldId>) -> Self {
        self.symmetric_field_id = Some(field_id.into());
        self
    }
}

/// The kind of computed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComputedKind {
    Formula,
    Lookup,
    Rollup,
    ConditionalRollup,
}

/// One source a computed field reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub node: FieldNode,
    pub link_field_id: Option<FieldId>,
    pub kind: EdgeKind,
}

impl SourceRef {
    fn direct(table_id: TableId, field_id: FieldId) -> Self {
        Self {
            node: FieldNode { table_id, field_id },
            link_field_id: None,
            kind: EdgeKind::Direct,
        }
    }

    fn conditional(table_id: TableId, field_id: FieldId) -> Self {
        Self {
            node: FieldNode { table_id, field_id },
            link_field_id: None,
            kind: EdgeKind::Conditional,
        }
    }
}

/// A field whose value is derived rather than entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedField {
    pub table_id: TableId,
    pub field_id: FieldId,
    pub kind: ComputedKind,
    pub source_refs: SmallVec<[SourceRef; 2]>,
}

/// How a dependency crosses (or does not cross) tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeKind {
    /// Same record, same table.
    Direct,
    /// Foreign records reached through a link field on the dependent's table.
    ViaLink,
    /// Foreign records selected by a filter; every dependent record is affected.
    Conditional,
}

/// "`to` is computed from `from`".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDependencyEdge {
    pub from: FieldNode,
    pub to: FieldNode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_field_id: Option<FieldId>,
    pub kind: EdgeKind,
}
