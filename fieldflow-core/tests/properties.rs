//! Property Tests for the Plan Compiler
//!
//! Random acyclic schemas over three linked tables. Every computed field
//! only reads fields defined before it, so the generated graphs never
//! contain a cycle.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use fieldflow_core::graph::{FieldDefinition, FieldKind, FieldNode, LinkDefinition};
use fieldflow_core::{ChangeType, ComputedSeed, DependencyGraph, ExecutionPlan, FieldId, PlanCompiler};

const TABLES: [&str; 3] = ["tblA", "tblB", "tblC"];

fn link_field(from: usize, to: usize) -> String {
    format!("lnk{}{}", from, to)
}

/// One generated field: the table it lives in, whether it is computed and a
/// selector for what it reads.
type Spec = (usize, bool, usize);

fn schema(specs: &[Spec]) -> (Vec<FieldDefinition>, Vec<LinkDefinition>) {
    let mut fields = Vec::new();
    let mut links = Vec::new();
    for from in 0..TABLES.len() {
        for to in 0..TABLES.len() {
            if from != to {
                let id = link_field(from, to);
                fields.push(FieldDefinition::new(TABLES[from], id.as_str(), id.as_str(), FieldKind::Link));
                links.push(LinkDefinition::new(TABLES[from], id.as_str(), TABLES[to]));
            }
        }
    }

    // (table, field id) of every value field defined so far.
    let mut defined: Vec<(usize, String)> = Vec::new();
    for (i, &(table, computed, pick)) in specs.iter().enumerate() {
        let id = format!("fld{i}");
        let kind = if !computed || defined.is_empty() {
            FieldKind::Plain
        } else {
            let (source_table, source) = defined[pick % defined.len()].clone();
            if source_table == table {
                // A second same-table reference keeps diamonds in play.
                let mut references = vec![FieldId::new(source)];
                if let Some((_, other)) = defined.iter().rev().find(|(t, _)| *t == table) {
                    references.push(FieldId::new(other.clone()));
                }
                references.dedup();
                FieldKind::Formula {
                    references,
                    expression: String::new(),
                }
            } else {
                FieldKind::Rollup {
                    link_field_id: FieldId::new(link_field(table, source_table)),
                    foreign_field_id: FieldId::new(source),
                    aggregation: "sum".into(),
                }
            }
        };
        fields.push(FieldDefinition::new(TABLES[table], id.as_str(), id.as_str(), kind));
        defined.push((table, id));
    }
    (fields, links)
}

fn specs() -> impl Strategy<Value = Vec<Spec>> {
    prop::collection::vec((0..TABLES.len(), any::<bool>(), any::<usize>()), 1..40)
}

fn compile(specs: &[Spec], seed_table: usize) -> (DependencyGraph, ExecutionPlan) {
    let (fields, links) = schema(specs);
    let graph = DependencyGraph::build(&fields, &links);
    let seed = ComputedSeed::records("bse", TABLES[seed_table], ChangeType::Update, vec!["rec1".into()]);
    let plan = PlanCompiler::new(&graph)
        .compile(&seed)
        .expect("generated schemas are acyclic");
    (graph, plan)
}

fn step_positions(plan: &ExecutionPlan) -> HashMap<FieldNode, usize> {
    let mut positions = HashMap::new();
    for (i, step) in plan.steps().iter().enumerate() {
        for field in &step.field_ids {
            positions.insert(FieldNode::new(step.table_id.clone(), field.clone()), i);
        }
    }
    positions
}

proptest! {
    /// Every edge goes from a lower level to a strictly higher one, and the
    /// steps run in non-decreasing level order.
    #[test]
    fn levels_respect_dependencies(specs in specs(), seed_table in 0..TABLES.len()) {
        let (_, plan) = compile(&specs, seed_table);

        for edge in plan.edges() {
            let from = plan.level_of(&edge.from);
            let to = plan.level_of(&edge.to);
            prop_assert!(from.is_some() && to.is_some());
            prop_assert!(from < to, "{} -> {}", edge.from, edge.to);
        }

        let positions = step_positions(&plan);
        for edge in plan.edges() {
            if let (Some(a), Some(b)) = (positions.get(&edge.from), positions.get(&edge.to)) {
                prop_assert!(a < b);
            }
        }

        prop_assert!(plan.steps().windows(2).all(|w| w[0].level <= w[1].level));
    }

    /// No field is scheduled twice and only computed fields are scheduled.
    #[test]
    fn fields_are_scheduled_once(specs in specs(), seed_table in 0..TABLES.len()) {
        let (graph, plan) = compile(&specs, seed_table);

        let mut seen = HashSet::new();
        for step in plan.steps() {
            prop_assert!(!step.field_ids.is_empty());
            for field in &step.field_ids {
                let node = FieldNode::new(step.table_id.clone(), field.clone());
                prop_assert!(graph.is_computed(&node));
                prop_assert!(seen.insert(node));
            }
        }
    }

    /// Batches cover every step, in order, without losing fields.
    #[test]
    fn batching_is_lossless(specs in specs(), seed_table in 0..TABLES.len()) {
        let (_, plan) = compile(&specs, seed_table);

        let batched: usize = plan.same_table_batches().iter().map(|b| b.field_count).sum();
        prop_assert_eq!(batched, plan.field_count());

        let steps: usize = plan.same_table_batches().iter().map(|b| b.step_count).sum();
        prop_assert_eq!(steps, plan.steps().len());

        for (batch, covered) in plan.batches() {
            prop_assert!(covered.iter().all(|s| s.table_id == batch.table_id));
            prop_assert!(covered.iter().all(|s| (batch.min_level..=batch.max_level).contains(&s.level)));
        }
        prop_assert!(plan
            .same_table_batches()
            .windows(2)
            .all(|w| w[0].table_id != w[1].table_id));
    }

    /// Compiling the same seed twice yields the same plan.
    #[test]
    fn compilation_is_deterministic(specs in specs(), seed_table in 0..TABLES.len()) {
        let (graph, plan) = compile(&specs, seed_table);
        let seed = ComputedSeed::records("bse", TABLES[seed_table], ChangeType::Update, vec!["rec1".into()]);
        let again = PlanCompiler::new(&graph).compile(&seed).expect("acyclic");
        prop_assert_eq!(plan, again);
    }
}
