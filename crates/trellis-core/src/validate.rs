//! Structural validation of a graph before execution.
//!
//! Cycles are legal: loop nodes rely on them and bound themselves at
//! runtime. The visited set only keeps the traversal finite.

use std::collections::HashSet;

use crate::error::{Result, TrellisError};
use crate::graph::GraphDefinition;

/// Check that `graph` can be executed.
///
/// In order: the node map is non-empty, the start node exists, every map
/// key matches its node's ID, every edge resolves, and every node is
/// reachable from the start node.
pub fn validate(graph: &GraphDefinition) -> Result<()> {
    if graph.nodes.is_empty() {
        return Err(TrellisError::EmptyGraph);
    }

    if !graph.nodes.contains_key(&graph.start_node_id) {
        return Err(TrellisError::StartNodeNotFound(graph.start_node_id.clone()));
    }

    for (key, node) in &graph.nodes {
        if node.id != *key {
            return Err(TrellisError::NodeIdMismatch {
                key: key.clone(),
                id: node.id.clone(),
            });
        }
        for next_id in &node.next_ids {
            if !graph.nodes.contains_key(next_id) {
                return Err(TrellisError::DanglingEdge {
                    from: key.clone(),
                    to: next_id.clone(),
                });
            }
        }
    }

    let visited = reachable_from_start(graph);
    if visited.len() != graph.nodes.len() {
        return Err(TrellisError::UnreachableNodes {
            visited: visited.len(),
            total: graph.nodes.len(),
        });
    }

    Ok(())
}

/// Depth-first walk from the start node.
fn reachable_from_start(graph: &GraphDefinition) -> HashSet<&str> {
    let mut visited = HashSet::new();
    let mut stack = vec![graph.start_node_id.as_str()];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        if let Some(node) = graph.nodes.get(id) {
            for next_id in node.next_ids.iter().rev() {
                if !visited.contains(next_id.as_str()) {
                    stack.push(next_id.as_str());
                }
            }
        }
    }
    visited
}

impl GraphDefinition {
    /// See [`validate`].
    pub fn validate(&self) -> Result<()> {
        validate(self)
    }
}
