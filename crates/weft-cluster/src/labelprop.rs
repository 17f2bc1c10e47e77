use std::collections::HashMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::{
    ClusterAlgorithm, ClusterError, ClusterInput, ClusterResult, IndexedGraph, ParameterSpec,
    canonicalize_labels, f64_param, u64_param,
};

/// Asynchronous label propagation: each node adopts the label with the
/// greatest incident weight, ties to the smallest label. Stops when a sweep
/// changes nothing or the iteration cap is reached.
pub struct LabelPropagation;

impl ClusterAlgorithm for LabelPropagation {
    fn name(&self) -> &'static str {
        "label_propagation"
    }

    fn parameter_schema(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec {
                name: "min_weight",
                description: "minimum edge weight for an edge to participate",
                default: Some(json!(0.0)),
                required: false,
            },
            ParameterSpec {
                name: "max_iterations",
                description: "sweep cap when propagation keeps oscillating",
                default: Some(json!(100)),
                required: false,
            },
            ParameterSpec {
                name: "random_seed",
                description: "seed for the per-sweep node order",
                default: Some(json!(0)),
                required: false,
            },
        ]
    }

    fn run(
        &self,
        input: &ClusterInput,
        params: &serde_json::Value,
    ) -> Result<ClusterResult, ClusterError> {
        let min_weight = f64_param(params, "min_weight", 0.0)?;
        let max_iterations = u64_param(params, "max_iterations", 100)?;
        let seed = u64_param(params, "random_seed", 0)?;
        if max_iterations == 0 {
            return Err(ClusterError::InvalidParameter("max_iterations".to_owned()));
        }

        let graph = IndexedGraph::build(input, min_weight);
        let node_count = graph.len();
        let mut label: Vec<usize> = (0..node_count).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..node_count).collect();

        for _ in 0..max_iterations {
            order.shuffle(&mut rng);
            let mut changed = false;

            for &node in &order {
                if graph.adjacency[node].is_empty() {
                    continue;
                }

                let mut weight_by_label = HashMap::<usize, f64>::new();
                for (neighbor, weight) in &graph.adjacency[node] {
                    *weight_by_label.entry(label[*neighbor]).or_insert(0.0) += weight;
                }

                let mut candidates = weight_by_label.into_iter().collect::<Vec<_>>();
                candidates.sort_by(|left, right| {
                    right
                        .1
                        .partial_cmp(&left.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| left.0.cmp(&right.0))
                });

                if let Some((best_label, _)) = candidates.first()
                    && *best_label != label[node]
                {
                    label[node] = *best_label;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        let labels = graph
            .ids
            .iter()
            .enumerate()
            .map(|(index, entity_id)| (*entity_id, label[index] as i64))
            .collect::<HashMap<_, _>>();
        let (assignments, cluster_count) = canonicalize_labels(&labels, None);

        Ok(ClusterResult {
            algorithm: self.name().to_owned(),
            parameters: json!({
                "min_weight": min_weight,
                "max_iterations": max_iterations,
                "random_seed": seed,
            }),
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
            entities: vec![1, 2, 3, 4, 5, 6, 9],
            edges: vec![
                ClusterEdge { src: 1, dst: 2, weight: 1.0 },
                ClusterEdge { src: 2, dst: 3, weight: 1.0 },
                ClusterEdge { src: 1, dst: 3, weight: 1.0 },
                ClusterEdge { src: 4, dst: 5, weight: 1.0 },
                ClusterEdge { src: 5, dst: 6, weight: 1.0 },
                ClusterEdge { src: 4, dst: 6, weight: 1.0 },
            ],
        }
    }

    #[test]
    fn triangles_converge_to_one_label_each() {
        let result = LabelPropagation.run(&input(), &json!({})).expect("run");

        assert_eq!(result.assignments[&1], result.assignments[&2]);
        assert_eq!(result.assignments[&1], result.assignments[&3]);
        assert_eq!(result.assignments[&4], result.assignments[&5]);
        assert_eq!(result.assignments[&4], result.assignments[&6]);
        assert_ne!(result.assignments[&1], result.assignments[&4]);
        // the isolated entity keeps its own singleton label
        assert!(result.assignments.contains_key(&9));
    }

    #[test]
    fn identical_seed_reproduces_assignments() {
        let first = LabelPropagation
            .run(&input(), &json!({"random_seed": 11}))
            .expect("run");
        let second = LabelPropagation
            .run(&input(), &json!({"random_seed": 11}))
            .expect("run");
        assert_eq!(first.assignments, second.assignments);
    }

    #[test]
    fn iteration_cap_must_be_positive() {
        let err = LabelPropagation
            .run(&input(), &json!({"max_iterations": 0}))
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidParameter(_)));
    }
}
