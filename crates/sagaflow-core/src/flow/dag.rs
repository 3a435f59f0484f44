//! Dependency scheduling: top-level execution order and cycle diagnostics.
//!
//! The order is computed with Kahn's algorithm over `depends_on` edges. Steps
//! caught in a cycle never reach in-degree zero and are left out of the order
//! instead of failing the flow; `find_cycles` names them for diagnostics.
//! Steps referenced from a condition branch, parallel group or loop body are
//! "owned" by that step and never scheduled at the top level.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use sagaflow_types::flow::FlowStep;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Result of scheduling a flow's steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// Top-level step IDs in execution order.
    pub order: Vec<String>,
    /// Step IDs executed only by their owning condition/parallel/loop step.
    pub owned: BTreeSet<String>,
    /// Top-level steps that never became ready (dependency cycles).
    pub unscheduled: Vec<String>,
}

impl ExecutionPlan {
    /// Whether every top-level step was scheduled.
    pub fn is_complete(&self) -> bool {
        self.unscheduled.is_empty()
    }
}

/// Build the top-level execution plan for `steps`.
pub fn build_execution_plan(steps: &[FlowStep]) -> ExecutionPlan {
    let owned = owned_step_ids(steps);
    let sorted = topological_order(steps);

    let scheduled: HashSet<&str> = sorted.iter().map(String::as_str).collect();
    let unscheduled = steps
        .iter()
        .filter(|s| !owned.contains(&s.id) && !scheduled.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect();
    let order = sorted
        .into_iter()
        .filter(|id| !owned.contains(id))
        .collect();

    ExecutionPlan {
        order,
        owned,
        unscheduled,
    }
}

/// Every step ID referenced by a branch, parallel list or loop body.
pub fn owned_step_ids(steps: &[FlowStep]) -> BTreeSet<String> {
    steps
        .iter()
        .flat_map(|s| s.owned_step_ids())
        .map(str::to_string)
        .collect()
}

/// Kahn's algorithm over all declared steps, in declaration order for ties.
///
/// Dependencies on undeclared IDs count toward in-degree but are never
/// released, so such steps are omitted just like cyclic ones.
pub fn topological_order(steps: &[FlowStep]) -> Vec<String> {
    let mut in_degree: Vec<(&str, usize)> = Vec::with_capacity(steps.len());
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for step in steps {
        if !index.contains_key(step.id.as_str()) {
            index.insert(step.id.as_str(), in_degree.len());
            in_degree.push((step.id.as_str(), 0));
        }
    }

    let mut dependents: HashMap<&str, Vec<usize>> = HashMap::new();
    for step in steps {
        let target = index[step.id.as_str()];
        for dep in &step.depends_on {
            dependents.entry(dep.as_str()).or_default().push(target);
            in_degree[target].1 += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, (_, degree))| *degree == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted = Vec::with_capacity(in_degree.len());
    while let Some(current) = queue.pop_front() {
        let id = in_degree[current].0;
        sorted.push(id.to_string());
        for &next in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
            let degree = &mut in_degree[next].1;
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                queue.push_back(next);
            }
        }
    }
    sorted
}

// ---------------------------------------------------------------------------
// Cycle diagnostics
// ---------------------------------------------------------------------------

/// Groups of step IDs that depend on each other cyclically.
///
/// Uses Tarjan's SCC algorithm; a group is either several mutually dependent
/// steps or a single step depending on itself. IDs inside a group are sorted.
pub fn find_cycles(steps: &[FlowStep]) -> Vec<Vec<String>> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in steps {
        for dep in &step.depends_on {
            if let Some(&from) = nodes.get(dep.as_str()) {
                graph.add_edge(from, nodes[step.id.as_str()], ());
            }
        }
    }

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || graph.contains_edge(component[0], component[0])
        })
        .map(|component| {
            let mut ids: Vec<String> = component.iter().map(|&n| graph[n].to_string()).collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();
    cycles
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
