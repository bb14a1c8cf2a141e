//! Dependency Graph
//!
//! This module implements the cross-table dependency graph between fields.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are `(table, field)` pairs
//! - Edges mean "the target field is computed from the source field"
//!
//! Formulas add edges between fields of one table. Lookups and rollups add
//! an edge from the foreign field, annotated with the link field it is
//! reached through, plus a direct edge from that link field. Conditional
//! rollups add edges from the foreign field and its filter fields.
//!
//! # Design Decisions
//!
//! 1. Nodes are plain keys and edges live in adjacency lists keyed by node,
//!    in both directions. No node holds a reference to another.
//!
//! 2. Acyclicity is enforced when a field is defined ([`validate`]); the plan
//!    compiler still defends against cycles with its own visited-set.
//!
//! 3. One graph per base is cached per process ([`GraphCache`]).

mod cache;
mod index;
mod node;
pub mod validate;

pub use cache::GraphCache;
pub use index::{DanglingReference, DependencyGraph};
pub use node::{
    ComputedField, ComputedKind, EdgeKind, FieldDefinition, FieldDependencyEdge, FieldKind,
    FieldNode, LinkDefinition, SourceRef,
};
pub use validate::{detect_cycle, validate_definitions, validate_field_change};
