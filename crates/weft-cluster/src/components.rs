use std::collections::HashMap;

use petgraph::unionfind::UnionFind;
use serde_json::json;

use crate::{
    ClusterAlgorithm, ClusterError, ClusterInput, ClusterResult, IndexedGraph, ParameterSpec,
    canonicalize_labels, f64_param,
};

/// Union-find over edges at or above `min_weight`. Every entity lands in
/// exactly one component; isolated entities form size-1 components.
pub struct ConnectedComponents;

impl ClusterAlgorithm for ConnectedComponents {
    fn name(&self) -> &'static str {
        "connected_components"
    }

    fn parameter_schema(&self) -> Vec<ParameterSpec> {
        vec![ParameterSpec {
            name: "min_weight",
            description: "minimum edge weight for an edge to connect two files",
            default: Some(json!(0.0)),
            required: false,
        }]
    }

    fn run(
        &self,
        input: &ClusterInput,
        params: &serde_json::Value,
    ) -> Result<ClusterResult, ClusterError> {
        let min_weight = f64_param(params, "min_weight", 0.0)?;
        let graph = IndexedGraph::build(input, min_weight);

        let mut union_find = UnionFind::<usize>::new(graph.len());
        for (src, neighbors) in graph.adjacency.iter().enumerate() {
            for (dst, _) in neighbors {
                union_find.union(src, *dst);
            }
        }

        let labels = graph
            .ids
            .iter()
            .enumerate()
            .map(|(index, entity_id)| (*entity_id, union_find.find(index) as i64))
            .collect::<HashMap<_, _>>();
        let (assignments, cluster_count) = canonicalize_labels(&labels, None);

        Ok(ClusterResult {
            algorithm: self.name().to_owned(),
            parameters: json!({ "min_weight": min_weight }),
            assignments,
            cluster_count,
            metrics: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{ClusterEdge, ClusterInput};

    fn input() -> ClusterInput {
        ClusterInput {
            entities: vec![1, 2, 3, 4, 5],
            edges: vec![
                ClusterEdge { src: 1, dst: 2, weight: 0.9 },
                ClusterEdge { src: 3, dst: 4, weight: 0.6 },
                ClusterEdge { src: 2, dst: 3, weight: 0.1 },
            ],
        }
    }

    #[test]
    fn weak_edges_are_ignored_and_singletons_survive() {
        let result = ConnectedComponents
            .run(&input(), &json!({"min_weight": 0.5}))
            .expect("run");

        assert_eq!(result.cluster_count, 3);
        assert_eq!(result.assignments[&1], result.assignments[&2]);
        assert_eq!(result.assignments[&3], result.assignments[&4]);
        assert_ne!(result.assignments[&1], result.assignments[&3]);
        // entity 5 is isolated but still present
        assert!(result.assignments.contains_key(&5));
        assert_ne!(result.assignments[&5], result.assignments[&1]);
    }

    #[test]
    fn zero_threshold_merges_through_weak_edges() {
        let result = ConnectedComponents.run(&input(), &json!({})).expect("run");
        assert_eq!(result.assignments[&1], result.assignments[&4]);
        assert_eq!(result.cluster_count, 2);
    }

    #[test]
    fn every_entity_appears_exactly_once() {
        let result = ConnectedComponents.run(&input(), &json!({})).expect("run");
        assert_eq!(result.assignments.len(), 5);
    }
}
