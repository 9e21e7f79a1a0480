//! Iterator resolution: which iterator nodes feed which inputs of a node.
//!
//! Walks incoming edges backwards from a target node. Router nodes are
//! transparent: their own incoming edge is followed until a non-router source
//! is reached. Only iterator sources produce a binding.

use std::collections::HashSet;

use serde::Serialize;
use tracing::warn;

use runweave_core::error::{Result, RunweaveError};
use runweave_core::graph::{Edge, GraphNode};
use runweave_core::traits::IteratorInput;
use runweave_core::types::NodeId;

/// An iterator feeding one input of one node. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IteratorBinding {
    pub iterator: GraphNode,
    pub input_key: String,
    /// The node consuming the iterator's values.
    pub node_id: NodeId,
}

impl IteratorBinding {
    pub fn value_count(&self) -> usize {
        self.iterator.iterator_values().len()
    }
}

/// One input value of a planned recipe run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedInput {
    pub node_id: NodeId,
    pub input_key: String,
    pub value: serde_json::Value,
}

/// One element of the cross product of all bound iterators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedRecipeRun {
    pub run_index_in_batch: u32,
    pub inputs: Vec<PlannedInput>,
}

/// Find every iterator that feeds a declared input of `node_id`.
///
/// Returns `None` when the node does not exist, is a router, has no incoming
/// edges, or no iterator is found behind any of its inputs.
pub fn resolve_preceding_iterators(
    node_id: &NodeId,
    nodes: &[GraphNode],
    edges: &[Edge],
) -> Option<Vec<IteratorBinding>> {
    let node = nodes.iter().find(|n| &n.id == node_id)?;
    if node.is_router() {
        return None;
    }

    let mut bindings = Vec::new();
    for edge in edges.iter().filter(|e| &e.target == node_id) {
        let Some(input_key) = edge.input_key() else {
            continue;
        };
        if let Some(iterator) = trace_source(edge, nodes, edges) {
            bindings.push(IteratorBinding {
                iterator: iterator.clone(),
                input_key: input_key.to_string(),
                node_id: node_id.clone(),
            });
        }
    }

    if bindings.is_empty() {
        None
    } else {
        Some(bindings)
    }
}

/// Follow `edge` upstream through routers; return the iterator at the end, if any.
fn trace_source<'a, 'b>(
    edge: &'b Edge,
    nodes: &'a [GraphNode],
    edges: &'b [Edge],
) -> Option<&'a GraphNode> {
    let mut visited: HashSet<&'a NodeId> = HashSet::new();
    let mut current = edge;
    loop {
        let source = nodes.iter().find(|n| n.id == current.source)?;
        if !source.is_router() {
            return source.is_iterator().then_some(source);
        }
        if !visited.insert(&source.id) {
            warn!(router = %source.id, "Router chain loops back on itself, ignoring input");
            return None;
        }
        current = edges.iter().find(|e| e.target == source.id)?;
    }
}

/// Number of recipe runs the cross product of `bindings` expands to.
///
/// Saturates at `u64::MAX` instead of overflowing.
pub fn combination_count(bindings: &[IteratorBinding]) -> u64 {
    bindings
        .iter()
        .fold(1u64, |acc, b| acc.saturating_mul(b.value_count() as u64))
}

/// Sum of values over all bound iterators.
pub fn total_iterator_values(bindings: &[IteratorBinding]) -> usize {
    bindings.iter().map(IteratorBinding::value_count).sum()
}

pub fn iterator_inputs(bindings: &[IteratorBinding]) -> Vec<IteratorInput> {
    bindings
        .iter()
        .map(|b| IteratorInput {
            node_id: b.node_id.clone(),
            input_key: b.input_key.clone(),
            iterator_id: b.iterator.id.clone(),
            values: b.iterator.iterator_values().to_vec(),
        })
        .collect()
}

/// Expand the cross product of `bindings` into recipe runs.
///
/// The first binding varies slowest. Indices are dense from zero. With no
/// bindings a single run without iterator inputs is planned. Fails when the
/// product does not fit the `u32` run index of a batch.
pub fn plan_recipe_runs(bindings: &[IteratorBinding]) -> Result<Vec<PlannedRecipeRun>> {
    let count = combination_count(bindings);
    if u32::try_from(count).is_err() {
        return Err(RunweaveError::Graph(format!(
            "{} combinations exceed the run index range of a batch",
            count
        )));
    }

    let mut rows: Vec<Vec<PlannedInput>> = vec![Vec::new()];
    for binding in bindings {
        let values = binding.iterator.iterator_values();
        rows = rows
            .into_iter()
            .flat_map(|row| {
                values.iter().map(move |value| {
                    let mut next = row.clone();
                    next.push(PlannedInput {
                        node_id: binding.node_id.clone(),
                        input_key: binding.input_key.clone(),
                        value: value.clone(),
                    });
                    next
                })
            })
            .collect();
    }

    Ok(rows
        .into_iter()
        .zip(0u32..)
        .map(|(inputs, run_index_in_batch)| PlannedRecipeRun {
            run_index_in_batch,
            inputs,
        })
        .collect())
}
