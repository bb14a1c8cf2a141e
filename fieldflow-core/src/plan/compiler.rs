//! Plan Compiler
//!
//! Turns a seed change into an [`ExecutionPlan`].
//!
//! # Algorithm
//!
//! 1. Seed nodes are the changed fields of the seed table (all of its fields
//!    when the seed names none). They sit at level 0; only the computed ones
//!    become steps. A seed that is one side of a two-way link also reaches
//!    the mirror link field on the foreign table, since relinking a record
//!    changes both sides.
//! 2. Breadth-first expansion over the dependency index: each round takes the
//!    one-hop dependents of the frontier, records every traversed edge with
//!    its discovery order, and keeps the nodes not yet visited as the next
//!    frontier. Each node is visited once.
//! 3. Levels are longest-path depths over the reached sub-graph, computed
//!    with Kahn's algorithm: `level(v) = 1 + max(level(u))` over plan edges
//!    `u -> v`. A node reached along paths of different lengths therefore
//!    gets the deepest one, which keeps diamonds correct. Nodes Kahn cannot
//!    release lie on a cycle; that is an invariant violation.
//! 4. Computed nodes are grouped into steps by `(level, table)`, field ids
//!    sorted. Within a level the table of the preceding step goes first so
//!    adjacent same-table steps can coalesce into batches.
//! 5. On a delete, fields of the seed table that only derive from the
//!    deleted records through same-record edges are left out of the steps.
//!    They stay in the traversal so their dependents elsewhere are reached.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use indexmap::IndexSet;

use super::model::{ChangeType, ComputedSeed, ExecutionPlan, PlanEdge, PlanStep};
use crate::error::PlanError;
use crate::graph::{DependencyGraph, EdgeKind, FieldNode};
use crate::ids::{FieldId, TableId};

/// Compiles seeds against one base's dependency graph.
pub struct PlanCompiler<'g> {
    graph: &'g DependencyGraph,
}

impl<'g> PlanCompiler<'g> {
    pub fn new(graph: &'g DependencyGraph) -> Self {
        Self { graph }
    }

    /// Compile the plan for `seed`.
    pub fn compile(&self, seed: &ComputedSeed) -> Result<ExecutionPlan, PlanError> {
        if seed.is_noop() {
            return Ok(ExecutionPlan::empty(seed));
        }

        let seeds = self.seed_nodes(seed);
        if seeds.is_empty() {
            return Ok(ExecutionPlan::empty(seed));
        }

        let (visited, edges) = self.traverse(&seeds);
        let levels = assign_levels(&visited, &edges)?;
        let retired = if seed.change_type == ChangeType::Delete && !seed.backfill {
            deleted_only(&seed.table_id, &levels, &edges)
        } else {
            HashSet::new()
        };
        let steps = self.group_steps(&levels, &retired)?;

        Ok(ExecutionPlan::new(seed, steps, edges, levels))
    }

    fn seed_nodes(&self, seed: &ComputedSeed) -> Vec<FieldNode> {
        let field_ids: Vec<FieldId> = if seed.field_ids.is_empty() {
            match self.graph.table_fields(&seed.table_id) {
                Ok(fields) => fields.to_vec(),
                Err(e) => {
                    // Fail-open: an unknown table has no dependents to enumerate.
                    tracing::warn!(error = %e, "seed table missing from dependency graph");
                    Vec::new()
                }
            }
        } else {
            seed.field_ids.clone()
        };

        let mut nodes: Vec<FieldNode> = field_ids
            .into_iter()
            .map(|f| FieldNode::new(seed.table_id.clone(), f))
            .filter(|node| match self.graph.lookup(node) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "seed field missing from dependency graph");
                    false
                }
            })
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    /// Visited-set BFS from the seeds.
    fn traverse(&self, seeds: &[FieldNode]) -> (IndexSet<FieldNode>, Vec<PlanEdge>) {
        let mut visited: IndexSet<FieldNode> = seeds.iter().cloned().collect();
        let mut frontier: Vec<FieldNode> = seeds.to_vec();
        let mut edges = Vec::new();

        for (link, mirror) in self.mirror_links(seeds) {
            edges.push(PlanEdge {
                from: link,
                to: mirror.clone(),
                link_field_id: Some(mirror.field_id.clone()),
                kind: EdgeKind::ViaLink,
                order: edges.len(),
            });
            if visited.insert(mirror.clone()) {
                frontier.push(mirror);
            }
        }

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for edge in self.graph.downstream(frontier.iter()) {
                edges.push(PlanEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    link_field_id: edge.link_field_id.clone(),
                    kind: edge.kind,
                    order: edges.len(),
                });
                if visited.insert(edge.to.clone()) {
                    next.push(edge.to.clone());
                }
            }
            frontier = next;
        }

        (visited, edges)
    }

    /// Seed link fields paired with their mirror on the foreign table. The
    /// mirror's records are the ones the link cells pointed at, so the edge is
    /// resolved like any other link hop. Mirrors that are seeds themselves are
    /// skipped to keep the plan acyclic.
    fn mirror_links(&self, seeds: &[FieldNode]) -> Vec<(FieldNode, FieldNode)> {
        seeds
            .iter()
            .filter_map(|node| {
                let link = self.graph.link(node)?;
                let mirror = FieldNode::new(
                    link.foreign_table_id.clone(),
                    link.symmetric_field_id.clone()?,
                );
                if self.graph.link(&mirror).is_none() || seeds.contains(&mirror) {
                    return None;
                }
                Some((node.clone(), mirror))
            })
            .collect()
    }

    fn group_steps(
        &self,
        levels: &BTreeMap<FieldNode, u32>,
        retired: &HashSet<FieldNode>,
    ) -> Result<Vec<PlanStep>, PlanError> {
        let mut by_level: BTreeMap<u32, BTreeMap<TableId, Vec<FieldId>>> = BTreeMap::new();
        for (node, level) in levels {
            if !self.graph.is_computed(node) || retired.contains(node) {
                continue;
            }
            by_level
                .entry(*level)
                .or_default()
                .entry(node.table_id.clone())
                .or_default()
                .push(node.field_id.clone());
        }

        let mut steps: Vec<PlanStep> = Vec::new();
        for (level, mut tables) in by_level {
            let carried = steps
                .last()
                .and_then(|s: &PlanStep| tables.remove_entry(&s.table_id));
            for (table_id, mut field_ids) in carried.into_iter().chain(tables) {
                field_ids.sort();
                steps.push(PlanStep {
                    table_id,
                    level,
                    field_ids,
                });
            }
        }

        let mut scheduled = HashSet::new();
        for step in &steps {
            for field_id in &step.field_ids {
                let node = FieldNode::new(step.table_id.clone(), field_id.clone());
                if !scheduled.insert(node.clone()) {
                    tracing::error!(node = %node, "field scheduled twice");
                    return Err(PlanError::DuplicateScheduling(node));
                }
            }
        }

        Ok(steps)
    }
}

/// Nodes of the deleted table whose every incoming edge is a same-record
/// edge from another such node (seeds have none). Their records are exactly
/// the deleted ones, so there is nothing left to recompute.
fn deleted_only(
    seed_table: &TableId,
    levels: &BTreeMap<FieldNode, u32>,
    edges: &[PlanEdge],
) -> HashSet<FieldNode> {
    let mut ordered: Vec<(&FieldNode, u32)> = levels.iter().map(|(n, l)| (n, *l)).collect();
    ordered.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

    let mut retired = HashSet::new();
    for (node, _) in ordered {
        if &node.table_id != seed_table {
            continue;
        }
        let local = edges
            .iter()
            .filter(|e| &e.to == node)
            .all(|e| e.kind == EdgeKind::Direct && retired.contains(&e.from));
        if local {
            retired.insert(node.clone());
        }
    }
    retired
}

/// Longest-path levels via Kahn's algorithm over the reached nodes.
fn assign_levels(
    visited: &IndexSet<FieldNode>,
    edges: &[PlanEdge],
) -> Result<BTreeMap<FieldNode, u32>, PlanError> {
    let mut in_degree: HashMap<&FieldNode, usize> = visited.iter().map(|n| (n, 0)).collect();
    let mut outgoing: HashMap<&FieldNode, Vec<&FieldNode>> = HashMap::new();
    for edge in edges {
        if let Some(degree) = in_degree.get_mut(&edge.to) {
            *degree += 1;
        }
        outgoing.entry(&edge.from).or_default().push(&edge.to);
    }

    let mut levels: BTreeMap<FieldNode, u32> = BTreeMap::new();
    let mut queue: VecDeque<&FieldNode> = visited
        .iter()
        .filter(|n| in_degree.get(n).copied() == Some(0))
        .collect();
    for node in &queue {
        levels.insert((*node).clone(), 0);
    }

    while let Some(node) = queue.pop_front() {
        let level = levels.get(node).copied().unwrap_or(0);
        for &dependent in outgoing.get(node).map(|d| d.as_slice()).unwrap_or(&[]) {
            let entry = levels.entry(dependent.clone()).or_insert(0);
            *entry = (*entry).max(level + 1);
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    let stuck: BTreeSet<&FieldNode> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(node, _)| node)
        .collect();
    if !stuck.is_empty() {
        let nodes: Vec<FieldNode> = stuck.into_iter().cloned().collect();
        tracing::error!(
            nodes = ?nodes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "dependency cycle reached during plan traversal"
        );
        return Err(PlanError::CycleDetected(nodes));
    }

    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FieldDefinition, FieldKind, LinkDefinition};
    use crate::plan::ChangeType;

    fn plain(table: &str, field: &str) -> FieldDefinition {
        FieldDefinition::new(table, field, field, FieldKind::Plain)
    }

    fn formula(table: &str, field: &str, refs: &[&str]) -> FieldDefinition {
        FieldDefinition::new(
            table,
            field,
            field,
            FieldKind::Formula {
                references: refs.iter().map(|r| (*r).into()).collect(),
                expression: String::new(),
            },
        )
    }

    fn update(table: &str, fields: &[&str]) -> ComputedSeed {
        ComputedSeed::records("bse", table, ChangeType::Update, vec!["rec1".into()])
            .with_fields(fields.iter().map(|f| FieldId::new(*f)))
    }

    fn node(table: &str, field: &str) -> FieldNode {
        FieldNode::new(table, field)
    }

    #[test]
    fn chain_gets_increasing_levels() {
        let graph = DependencyGraph::build(
            &[plain("t", "a"), formula("t", "b", &["a"]), formula("t", "c", &["b"])],
            &[],
        );
        let plan = PlanCompiler::new(&graph).compile(&update("t", &["a"])).unwrap();

        let levels: Vec<(u32, Vec<&str>)> = plan
            .steps()
            .iter()
            .map(|s| (s.level, s.field_ids.iter().map(|f| f.as_str()).collect()))
            .collect();
        assert_eq!(levels, vec![(1, vec!["b"]), (2, vec!["c"])]);
        assert_eq!(plan.level_of(&node("t", "a")), Some(0));
        assert_eq!(plan.edges().len(), 2);
        assert_eq!(plan.edges()[1].order, 1);

        // One table, contiguous: a single batch.
        assert_eq!(plan.same_table_batches().len(), 1);
        assert_eq!(plan.same_table_batches()[0].step_count, 2);
        assert_eq!(plan.same_table_batches()[0].min_level, 1);
        assert_eq!(plan.same_table_batches()[0].max_level, 2);
    }

    #[test]
    fn diamond_takes_longest_path() {
        // a -> b -> c -> d and a -> d: d must wait for c.
        let graph = DependencyGraph::build(
            &[
                plain("t", "a"),
                formula("t", "b", &["a"]),
                formula("t", "c", &["b"]),
                formula("t", "d", &["a", "c"]),
            ],
            &[],
        );
        let plan = PlanCompiler::new(&graph).compile(&update("t", &["a"])).unwrap();

        assert_eq!(plan.level_of(&node("t", "d")), Some(3));
        let scheduled: usize = plan.steps().iter().map(|s| s.field_ids.len()).sum();
        assert_eq!(scheduled, 3);
        for edge in plan.edges() {
            assert!(plan.level_of(&edge.from) < plan.level_of(&edge.to));
        }
    }

    #[test]
    fn unrelated_change_yields_empty_plan() {
        let graph = DependencyGraph::build(
            &[plain("t", "a"), plain("t", "z"), formula("t", "b", &["a"])],
            &[],
        );
        let plan = PlanCompiler::new(&graph).compile(&update("t", &["z"])).unwrap();
        assert!(plan.is_empty());
        assert!(plan.same_table_batches().is_empty());
    }

    #[test]
    fn empty_record_ids_short_circuit() {
        let graph = DependencyGraph::build(&[plain("t", "a"), formula("t", "b", &["a"])], &[]);
        let seed = ComputedSeed::records("bse", "t", ChangeType::Update, Vec::new());
        let plan = PlanCompiler::new(&graph).compile(&seed).unwrap();
        assert!(plan.is_empty());
        assert!(plan.edges().is_empty());
    }

    #[test]
    fn backfill_schedules_seed_field_at_level_zero() {
        let graph = DependencyGraph::build(
            &[plain("t", "a"), formula("t", "b", &["a"]), formula("t", "c", &["b"])],
            &[],
        );
        let seed = ComputedSeed::backfill("bse", "t", vec![FieldId::new("b")]);
        let plan = PlanCompiler::new(&graph).compile(&seed).unwrap();

        assert_eq!(plan.steps()[0].level, 0);
        assert_eq!(plan.steps()[0].field_ids, vec![FieldId::new("b")]);
        assert_eq!(plan.steps()[1].level, 1);
    }

    #[test]
    fn insert_seeds_every_field_and_orders_siblings() {
        let graph = DependencyGraph::build(
            &[plain("t", "a"), formula("t", "b", &["a"]), formula("t", "c", &["b"])],
            &[],
        );
        let seed = ComputedSeed::records("bse", "t", ChangeType::Insert, vec!["rec1".into()]);
        let plan = PlanCompiler::new(&graph).compile(&seed).unwrap();

        // b is a seed but depends on a, so it still lands after it.
        assert_eq!(plan.level_of(&node("t", "b")), Some(1));
        assert_eq!(plan.level_of(&node("t", "c")), Some(2));
    }

    #[test]
    fn cross_table_rollup_plan() {
        let graph = DependencyGraph::build(
            &[
                plain("tblOrders", "fldPrice"),
                FieldDefinition::new("tblCustomers", "fldOrders", "Orders", FieldKind::Link),
                FieldDefinition::new(
                    "tblCustomers",
                    "fldTotalSpend",
                    "Total spend",
                    FieldKind::Rollup {
                        link_field_id: "fldOrders".into(),
                        foreign_field_id: "fldPrice".into(),
                        aggregation: "sum".into(),
                    },
                ),
            ],
            &[LinkDefinition::new("tblCustomers", "fldOrders", "tblOrders")],
        );
        let plan = PlanCompiler::new(&graph)
            .compile(&update("tblOrders", &["fldPrice"]))
            .unwrap();

        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].table_id.as_str(), "tblCustomers");
        assert_eq!(plan.steps()[0].level, 1);
        assert_eq!(plan.edges()[0].link_field_id, Some(FieldId::new("fldOrders")));
    }

    #[test]
    fn preceding_table_leads_its_level() {
        // Level 1: tblA.y and tblB.x; level 2: tblB.z and tblA.w.
        let graph = DependencyGraph::build(
            &[
                plain("tblA", "s"),
                formula("tblA", "y", &["s"]),
                formula("tblA", "w", &["y"]),
                FieldDefinition::new("tblB", "fldLinkA", "A", FieldKind::Link),
                FieldDefinition::new(
                    "tblB",
                    "x",
                    "x",
                    FieldKind::Lookup {
                        link_field_id: "fldLinkA".into(),
                        foreign_field_id: "s".into(),
                    },
                ),
                formula("tblB", "z", &["x"]),
            ],
            &[LinkDefinition::new("tblB", "fldLinkA", "tblA")],
        );
        let plan = PlanCompiler::new(&graph).compile(&update("tblA", &["s"])).unwrap();

        let order: Vec<(&str, u32)> = plan
            .steps()
            .iter()
            .map(|s| (s.table_id.as_str(), s.level))
            .collect();
        assert_eq!(order, vec![("tblA", 1), ("tblB", 1), ("tblB", 2), ("tblA", 2)]);
        assert_eq!(plan.same_table_batches().len(), 3);
        assert_eq!(plan.same_table_batches()[1].step_count, 2);
    }

    fn spend_schema(total_ref: &str, symmetric: bool) -> DependencyGraph {
        let (mut to_customer, mut to_orders) = (
            LinkDefinition::new("tblOrders", "fldCustomer", "tblCustomers"),
            LinkDefinition::new("tblCustomers", "fldOrders", "tblOrders"),
        );
        if symmetric {
            to_customer = to_customer.with_symmetric("fldOrders");
            to_orders = to_orders.with_symmetric("fldCustomer");
        }
        DependencyGraph::build(
            &[
                plain("tblOrders", "fldPrice"),
                formula("tblOrders", "fldTotal", &["fldPrice"]),
                FieldDefinition::new("tblOrders", "fldCustomer", "Customer", FieldKind::Link),
                FieldDefinition::new("tblCustomers", "fldOrders", "Orders", FieldKind::Link),
                FieldDefinition::new(
                    "tblCustomers",
                    "fldSpend",
                    "Spend",
                    FieldKind::Rollup {
                        link_field_id: "fldOrders".into(),
                        foreign_field_id: total_ref.into(),
                        aggregation: "sum".into(),
                    },
                ),
            ],
            &[to_customer, to_orders],
        )
    }

    #[test]
    fn delete_leaves_out_fields_of_the_deleted_rows() {
        let graph = spend_schema("fldTotal", false);
        let seed = ComputedSeed::records("bse", "tblOrders", ChangeType::Delete, vec!["rec1".into()]);
        let plan = PlanCompiler::new(&graph).compile(&seed).unwrap();

        let order: Vec<(&str, u32)> = plan
            .steps()
            .iter()
            .map(|s| (s.table_id.as_str(), s.level))
            .collect();
        assert_eq!(order, vec![("tblCustomers", 2)]);
        assert_eq!(plan.same_table_batches().len(), 1);
        // Still traversed, so the rollup behind it is reached.
        assert_eq!(plan.level_of(&node("tblOrders", "fldTotal")), Some(1));

        // An update of the same fields recomputes the formula.
        let seed = update("tblOrders", &["fldPrice"]);
        let plan = PlanCompiler::new(&graph).compile(&seed).unwrap();
        let order: Vec<(&str, u32)> = plan
            .steps()
            .iter()
            .map(|s| (s.table_id.as_str(), s.level))
            .collect();
        assert_eq!(order, vec![("tblOrders", 1), ("tblCustomers", 2)]);
    }

    #[test]
    fn delete_keeps_local_fields_fed_through_links() {
        // tblOrders.fldEcho reads the customer rollup back, so orders that
        // survive the delete still need it recomputed.
        let mut fields = vec![
            plain("tblOrders", "fldPrice"),
            FieldDefinition::new("tblOrders", "fldCustomer", "Customer", FieldKind::Link),
            FieldDefinition::new("tblCustomers", "fldOrders", "Orders", FieldKind::Link),
            FieldDefinition::new(
                "tblCustomers",
                "fldSpend",
                "Spend",
                FieldKind::Rollup {
                    link_field_id: "fldOrders".into(),
                    foreign_field_id: "fldPrice".into(),
                    aggregation: "sum".into(),
                },
            ),
        ];
        fields.push(FieldDefinition::new(
            "tblOrders",
            "fldEcho",
            "Echo",
            FieldKind::Lookup {
                link_field_id: "fldCustomer".into(),
                foreign_field_id: "fldSpend".into(),
            },
        ));
        let graph = DependencyGraph::build(
            &fields,
            &[
                LinkDefinition::new("tblOrders", "fldCustomer", "tblCustomers"),
                LinkDefinition::new("tblCustomers", "fldOrders", "tblOrders"),
            ],
        );
        let seed = ComputedSeed::records("bse", "tblOrders", ChangeType::Delete, vec!["rec1".into()])
            .with_fields(vec![FieldId::new("fldPrice")]);
        let plan = PlanCompiler::new(&graph).compile(&seed).unwrap();

        let order: Vec<(&str, u32)> = plan
            .steps()
            .iter()
            .map(|s| (s.table_id.as_str(), s.level))
            .collect();
        assert_eq!(order, vec![("tblCustomers", 1), ("tblOrders", 2)]);
    }

    #[test]
    fn relinking_reaches_the_mirror_link() {
        let graph = spend_schema("fldPrice", true);
        let plan = PlanCompiler::new(&graph)
            .compile(&update("tblOrders", &["fldCustomer"]))
            .unwrap();

        let mirror = &plan.edges()[0];
        assert_eq!(mirror.from, node("tblOrders", "fldCustomer"));
        assert_eq!(mirror.to, node("tblCustomers", "fldOrders"));
        assert_eq!(mirror.kind, EdgeKind::ViaLink);
        assert_eq!(mirror.link_field_id, Some(FieldId::new("fldOrders")));
        assert_eq!(plan.level_of(&node("tblCustomers", "fldOrders")), Some(1));
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].field_ids, vec![FieldId::new("fldSpend")]);
        assert_eq!(plan.steps()[0].level, 2);

        // A one-way link has no mirror to follow.
        let graph = spend_schema("fldPrice", false);
        let plan = PlanCompiler::new(&graph)
            .compile(&update("tblOrders", &["fldCustomer"]))
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn both_sides_seeded_adds_no_mirror_edges() {
        let graph = DependencyGraph::build(
            &[
                FieldDefinition::new("t", "fldParent", "Parent", FieldKind::Link),
                FieldDefinition::new("t", "fldChildren", "Children", FieldKind::Link),
            ],
            &[
                LinkDefinition::new("t", "fldParent", "t").with_symmetric("fldChildren"),
                LinkDefinition::new("t", "fldChildren", "t").with_symmetric("fldParent"),
            ],
        );
        let seed = ComputedSeed::records("bse", "t", ChangeType::Update, vec!["rec1".into()]);
        let plan = PlanCompiler::new(&graph).compile(&seed).unwrap();
        assert!(plan.edges().is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn cycle_is_an_invariant_violation() {
        let graph = DependencyGraph::build(
            &[plain("t", "a"), formula("t", "b", &["a", "c"]), formula("t", "c", &["b"])],
            &[],
        );
        let err = PlanCompiler::new(&graph).compile(&update("t", &["a"])).unwrap_err();
        match err {
            PlanError::CycleDetected(nodes) => {
                assert_eq!(nodes, vec![node("t", "b"), node("t", "c")]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
