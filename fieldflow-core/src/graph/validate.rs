//! Definition-time validation.
//!
//! When a computed field is created or edited we must verify that every
//! reference resolves and that the new definition does not close a cycle
//! (e.g. `A.total` rolls up `B.price`, `B.price` looks up `A.total`).
//! Cycles are found with a three-colour depth-first search over the whole
//! index, independent of the plan compiler's own visited-set.

use std::collections::HashMap;

use super::index::DependencyGraph;
use super::node::{FieldDefinition, FieldNode, LinkDefinition};
use crate::error::DefinitionError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Detect a dependency cycle anywhere in the graph.
///
/// Returns the cycle path (first node repeated at the end) if one exists.
pub fn detect_cycle(graph: &DependencyGraph) -> Option<Vec<FieldNode>> {
    let mut colour: HashMap<&FieldNode, Colour> = HashMap::new();
    let mut path: Vec<&FieldNode> = Vec::new();

    for start in graph.nodes() {
        if colour.get(start).copied().unwrap_or(Colour::White) == Colour::White
            && visit(start, graph, &mut colour, &mut path)
        {
            return Some(path.into_iter().cloned().collect());
        }
    }
    None
}

fn visit<'g>(
    current: &'g FieldNode,
    graph: &'g DependencyGraph,
    colour: &mut HashMap<&'g FieldNode, Colour>,
    path: &mut Vec<&'g FieldNode>,
) -> bool {
    colour.insert(current, Colour::Grey);
    path.push(current);

    // Walk raw outgoing edges: an unresolved field on a cycle is still a cycle.
    for edge in graph.raw_dependents_of(current) {
        match colour.get(&edge.to).copied().unwrap_or(Colour::White) {
            Colour::Grey => {
                let begin = path.iter().position(|n| *n == &edge.to).unwrap_or(0);
                path.drain(..begin);
                path.push(&edge.to);
                return true;
            }
            Colour::White => {
                if visit(&edge.to, graph, colour, path) {
                    return true;
                }
            }
            Colour::Black => {}
        }
    }

    path.pop();
    colour.insert(current, Colour::Black);
    false
}

/// Validate a complete set of definitions.
///
/// Returns the built index when every reference resolves and the graph is
/// acyclic, otherwise every problem found.
pub fn validate_definitions(
    fields: &[FieldDefinition],
    links: &[LinkDefinition],
) -> Result<DependencyGraph, Vec<DefinitionError>> {
    let graph = DependencyGraph::build(fields, links);

    let mut errors: Vec<DefinitionError> = graph
        .dangling()
        .iter()
        .cloned()
        .map(DefinitionError::from)
        .collect();

    if let Some(cycle) = detect_cycle(&graph) {
        errors.push(DefinitionError::CycleDetected(cycle));
    }

    if errors.is_empty() {
        Ok(graph)
    } else {
        Err(errors)
    }
}

/// Validate a field being created or replaced against the current schema.
pub fn validate_field_change(
    existing: &[FieldDefinition],
    links: &[LinkDefinition],
    candidate: &FieldDefinition,
) -> Result<(), Vec<DefinitionError>> {
    let mut fields: Vec<FieldDefinition> = existing
        .iter()
        .filter(|f| f.node() != candidate.node())
        .cloned()
        .collect();
    fields.push(candidate.clone());

    validate_definitions(&fields, links).map(|_| ())
}
