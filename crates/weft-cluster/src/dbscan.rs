use std::collections::{HashMap, VecDeque};

use serde_json::json;

use crate::{
    ClusterAlgorithm, ClusterError, ClusterInput, ClusterResult, IndexedGraph, ParameterSpec,
    canonicalize_labels, f64_param, u64_param,
};

const UNVISITED: i64 = -2;
const NOISE: i64 = -1;

/// Density clustering over the precomputed `1 − weight` distance. Entities
/// without a dense neighborhood end up in the noise cluster (id 0).
pub struct Dbscan;

impl ClusterAlgorithm for Dbscan {
    fn name(&self) -> &'static str {
        "dbscan"
    }

    fn parameter_schema(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec {
                name: "eps",
                description: "neighborhood radius in distance space (1 - weight)",
                default: Some(json!(0.5)),
                required: false,
            },
            ParameterSpec {
                name: "min_samples",
                description: "neighborhood size (including the point) for a core point",
                default: Some(json!(2)),
                required: false,
            },
        ]
    }

    fn run(
        &self,
        input: &ClusterInput,
        params: &serde_json::Value,
    ) -> Result<ClusterResult, ClusterError> {
        let eps = f64_param(params, "eps", 0.5)?;
        let min_samples = u64_param(params, "min_samples", 2)? as usize;
        if !(0.0..=1.0).contains(&eps) {
            return Err(ClusterError::InvalidParameter("eps".to_owned()));
        }
        if min_samples == 0 {
            return Err(ClusterError::InvalidParameter("min_samples".to_owned()));
        }

        let graph = IndexedGraph::build(input, 0.0);
        let node_count = graph.len();

        // neighborhoods under distance = 1 - weight; absent edges sit at
        // distance 1.0 and only qualify when eps reaches 1.0
        let mut neighborhoods: Vec<Vec<usize>> = vec![Vec::new(); node_count];
        for (node, neighbors) in graph.adjacency.iter().enumerate() {
            for (neighbor, weight) in neighbors {
                if 1.0 - weight <= eps {
                    neighborhoods[node].push(*neighbor);
                }
            }
        }

        let mut label = vec![UNVISITED; node_count];
        let mut next_cluster = 0i64;

        for node in 0..node_count {
            if label[node] != UNVISITED {
                continue;
            }
            if neighborhoods[node].len() + 1 < min_samples {
                label[node] = NOISE;
                continue;
            }

            let cluster = next_cluster;
            next_cluster += 1;
            label[node] = cluster;

            let mut queue = neighborhoods[node].iter().copied().collect::<VecDeque<_>>();
            while let Some(candidate) = queue.pop_front() {
                if label[candidate] == NOISE {
                    // border point reached from a core point
                    label[candidate] = cluster;
                }
                if label[candidate] != UNVISITED {
                    continue;
                }
                label[candidate] = cluster;
                if neighborhoods[candidate].len() + 1 >= min_samples {
                    queue.extend(neighborhoods[candidate].iter().copied());
                }
            }
        }

        let labels = graph
            .ids
            .iter()
            .enumerate()
            .map(|(index, entity_id)| (*entity_id, label[index]))
            .collect::<HashMap<_, _>>();
        let (assignments, cluster_count) = canonicalize_labels(&labels, Some(NOISE));

        Ok(ClusterResult {
            algorithm: self.name().to_owned(),
            parameters: json!({ "eps": eps, "min_samples": min_samples }),
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
    use crate::{ClusterEdge, ClusterInput, NOISE_CLUSTER};

    fn input() -> ClusterInput {
        ClusterInput {
            entities: vec![1, 2, 3, 4, 9],
            edges: vec![
                ClusterEdge { src: 1, dst: 2, weight: 0.9 },
                ClusterEdge { src: 2, dst: 3, weight: 0.8 },
                ClusterEdge { src: 3, dst: 4, weight: 0.2 },
            ],
        }
    }

    #[test]
    fn dense_chains_cluster_and_isolates_become_noise() {
        let result = Dbscan.run(&input(), &json!({})).expect("run");

        assert_eq!(result.assignments[&1], result.assignments[&2]);
        assert_eq!(result.assignments[&2], result.assignments[&3]);
        // 3-4 sits at distance 0.8, outside the default eps
        assert_eq!(result.assignments[&4], NOISE_CLUSTER);
        assert_eq!(result.assignments[&9], NOISE_CLUSTER);
        assert_eq!(result.cluster_count, 1);
    }

    #[test]
    fn min_samples_governs_core_points() {
        let result = Dbscan
            .run(&input(), &json!({"min_samples": 3}))
            .expect("run");

        // only entity 2 has two eps-neighbors, so the chain still forms
        assert_eq!(result.assignments[&2], result.assignments[&1]);
        assert_eq!(result.cluster_count, 1);

        let strict = Dbscan
            .run(&input(), &json!({"min_samples": 4}))
            .expect("run");
        assert_eq!(strict.cluster_count, 0);
        assert!(strict.assignments.values().all(|cluster| *cluster == NOISE_CLUSTER));
    }

    #[test]
    fn invalid_eps_is_rejected() {
        let err = Dbscan.run(&input(), &json!({"eps": 1.5})).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidParameter(_)));
    }
}
