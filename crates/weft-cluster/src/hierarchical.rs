use std::collections::HashMap;

use serde_json::json;

use crate::{
    ClusterAlgorithm, ClusterError, ClusterInput, ClusterResult, IndexedGraph, ParameterSpec,
    canonicalize_labels, f64_param, optional_f64_param, optional_u64_param, str_param, u64_param,
};

const DEFAULT_MAX_NODES: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Linkage {
    Ward,
    Complete,
    Average,
    Single,
}

impl Linkage {
    fn parse(value: &str) -> Result<Self, ClusterError> {
        match value {
            "ward" => Ok(Self::Ward),
            "complete" => Ok(Self::Complete),
            "average" => Ok(Self::Average),
            "single" => Ok(Self::Single),
            _ => Err(ClusterError::InvalidParameter("linkage".to_owned())),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ward => "ward",
            Self::Complete => "complete",
            Self::Average => "average",
            Self::Single => "single",
        }
    }
}

/// Agglomerative clustering over the dense `1 − weight` distance matrix.
/// The naive merge loop is O(N³), so inputs are capped at `max_nodes`
/// (default 500).
pub struct Hierarchical;

impl ClusterAlgorithm for Hierarchical {
    fn name(&self) -> &'static str {
        "hierarchical"
    }

    fn parameter_schema(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec {
                name: "linkage",
                description: "linkage criterion: ward, complete, average or single",
                default: Some(json!("average")),
                required: false,
            },
            ParameterSpec {
                name: "n_clusters",
                description: "stop once this many clusters remain",
                default: None,
                required: false,
            },
            ParameterSpec {
                name: "distance_threshold",
                description: "stop before merging clusters further apart than this",
                default: None,
                required: false,
            },
            ParameterSpec {
                name: "min_weight",
                description: "minimum edge weight for an edge to participate",
                default: Some(json!(0.0)),
                required: false,
            },
            ParameterSpec {
                name: "max_nodes",
                description: "refuse inputs larger than this",
                default: Some(json!(DEFAULT_MAX_NODES)),
                required: false,
            },
        ]
    }

    fn run(
        &self,
        input: &ClusterInput,
        params: &serde_json::Value,
    ) -> Result<ClusterResult, ClusterError> {
        let linkage = Linkage::parse(str_param(params, "linkage", "average")?)?;
        let n_clusters = optional_u64_param(params, "n_clusters")?;
        let distance_threshold = optional_f64_param(params, "distance_threshold")?;
        let min_weight = f64_param(params, "min_weight", 0.0)?;
        let max_nodes = u64_param(params, "max_nodes", DEFAULT_MAX_NODES)?;

        let (target_clusters, threshold) = match (n_clusters, distance_threshold) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(ClusterError::InvalidParameter(
                    "exactly one of n_clusters and distance_threshold".to_owned(),
                ));
            }
            (Some(n), None) if n == 0 => {
                return Err(ClusterError::InvalidParameter("n_clusters".to_owned()));
            }
            (Some(n), None) => (n as usize, f64::INFINITY),
            (None, Some(threshold)) => (1, threshold),
        };

        let graph = IndexedGraph::build(input, min_weight);
        let node_count = graph.len();
        if node_count as u64 > max_nodes {
            return Err(ClusterError::InvalidParameter("max_nodes".to_owned()));
        }

        let mut assignments_raw = agglomerate(&graph, linkage, target_clusters, threshold);

        let labels = graph
            .ids
            .iter()
            .enumerate()
            .map(|(index, entity_id)| (*entity_id, assignments_raw.remove(&index).unwrap_or(0)))
            .collect::<HashMap<_, _>>();
        let (assignments, cluster_count) = canonicalize_labels(&labels, None);

        Ok(ClusterResult {
            algorithm: self.name().to_owned(),
            parameters: json!({
                "linkage": linkage.as_str(),
                "n_clusters": n_clusters,
                "distance_threshold": distance_threshold,
                "min_weight": min_weight,
            }),
            assignments,
            cluster_count,
            metrics: None,
        })
    }
}

fn agglomerate(
    graph: &IndexedGraph,
    linkage: Linkage,
    target_clusters: usize,
    threshold: f64,
) -> HashMap<usize, i64> {
    let node_count = graph.len();
    let mut distance = vec![vec![1.0f64; node_count]; node_count];
    for (node, row) in distance.iter_mut().enumerate() {
        row[node] = 0.0;
    }
    for (src, neighbors) in graph.adjacency.iter().enumerate() {
        for (dst, weight) in neighbors {
            let value = (1.0 - weight).clamp(0.0, 1.0);
            distance[src][*dst] = value;
        }
    }
    if linkage == Linkage::Ward {
        for row in &mut distance {
            for value in row.iter_mut() {
                *value = *value * *value;
            }
        }
    }

    // cluster slots; a merged-away slot becomes None
    let mut clusters: Vec<Option<Vec<usize>>> =
        (0..node_count).map(|node| Some(vec![node])).collect();
    let mut active = node_count;

    while active > target_clusters {
        let mut best: Option<(usize, usize, f64)> = None;
        for left in 0..node_count {
            if clusters[left].is_none() {
                continue;
            }
            for right in (left + 1)..node_count {
                if clusters[right].is_none() {
                    continue;
                }
                let candidate = distance[left][right];
                if best.is_none_or(|(_, _, best_distance)| candidate < best_distance) {
                    best = Some((left, right, candidate));
                }
            }
        }

        let Some((left, right, merge_distance)) = best else {
            break;
        };
        let effective = if linkage == Linkage::Ward {
            merge_distance.sqrt()
        } else {
            merge_distance
        };
        if effective > threshold {
            break;
        }

        let left_size = clusters[left].as_ref().map(Vec::len).unwrap_or(0) as f64;
        let right_size = clusters[right].as_ref().map(Vec::len).unwrap_or(0) as f64;

        for other in 0..node_count {
            if other == left || other == right || clusters[other].is_none() {
                continue;
            }
            let other_size = clusters[other].as_ref().map(Vec::len).unwrap_or(0) as f64;
            let to_left = distance[other][left];
            let to_right = distance[other][right];

            let merged = match linkage {
                Linkage::Single => to_left.min(to_right),
                Linkage::Complete => to_left.max(to_right),
                Linkage::Average => {
                    (left_size * to_left + right_size * to_right) / (left_size + right_size)
                }
                Linkage::Ward => {
                    let total = left_size + right_size + other_size;
                    ((left_size + other_size) * to_left + (right_size + other_size) * to_right
                        - other_size * merge_distance)
                        / total
                }
            };
            distance[other][left] = merged;
            distance[left][other] = merged;
        }

        let absorbed = clusters[right].take().unwrap_or_default();
        if let Some(surviving) = clusters[left].as_mut() {
            surviving.extend(absorbed);
        }
        active -= 1;
    }

    let mut assignments = HashMap::new();
    for (slot, members) in clusters.iter().enumerate() {
        let Some(members) = members else {
            continue;
        };
        for member in members {
            assignments.insert(*member, slot as i64);
        }
    }
    assignments
}
