//! DAG validation and dependency walkers.
//!
//! Uses `petgraph` to model `depends_on` edges as a directed graph.
//! Topological sort detects cycles; the executor resolves readiness
//! event-driven, so no wave computation happens here.

use std::collections::{HashMap, HashSet};

use conveyor_types::workflow::StepDefinition;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

/// Validate that steps form a DAG: all `depends_on` references exist and
/// there are no cycles.
pub fn validate_dag(steps: &[(String, StepDefinition)]) -> Result<(), WorkflowError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|(id, _)| graph.add_node(id.as_str())).collect();

    for (step_id, step) in steps {
        let to_idx = id_to_idx[step_id.as_str()];
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency { step_id: step_id.clone(), dep: dep.clone() }
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(node_id.to_string())
    })?;

    Ok(())
}

/// All steps that transitively depend on `step_id`.
pub fn transitive_dependents(step_id: &str, steps: &[(String, StepDefinition)]) -> HashSet<String> {
    // Forward edges: producer -> consumers.
    let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, step) in steps {
        for dep in &step.depends_on {
            consumers.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut visited = HashSet::new();
    let mut stack = vec![step_id];
    while let Some(current) = stack.pop() {
        if let Some(next) = consumers.get(current) {
            for dependent in next {
                if visited.insert(dependent.to_string()) {
                    stack.push(dependent);
                }
            }
        }
    }
    visited
}
