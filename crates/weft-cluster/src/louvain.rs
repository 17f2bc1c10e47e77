use std::collections::HashMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;

use crate::{
    ClusterAlgorithm, ClusterError, ClusterInput, ClusterResult, IndexedGraph, ParameterSpec,
    canonicalize_labels, f64_param, u64_param,
};

/// Modularity optimization with the classic two-phase pass: local moves until
/// no gain, then community aggregation. The node visit order is shuffled with
/// the seeded generator, so identical input and seed reproduce the partition.
pub struct Louvain;

impl ClusterAlgorithm for Louvain {
    fn name(&self) -> &'static str {
        "louvain"
    }

    fn parameter_schema(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec {
                name: "resolution",
                description: "modularity resolution; higher values favor smaller communities",
                default: Some(json!(1.0)),
                required: false,
            },
            ParameterSpec {
                name: "min_weight",
                description: "minimum edge weight for an edge to participate",
                default: Some(json!(0.0)),
                required: false,
            },
            ParameterSpec {
                name: "random_seed",
                description: "seed for the node visit order",
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
        let resolution = f64_param(params, "resolution", 1.0)?;
        let min_weight = f64_param(params, "min_weight", 0.0)?;
        let seed = u64_param(params, "random_seed", 0)?;
        if resolution <= 0.0 {
            return Err(ClusterError::InvalidParameter("resolution".to_owned()));
        }

        let graph = IndexedGraph::build(input, min_weight);
        let mut level = weighted_adjacency(&graph);
        let mut membership: Vec<usize> = (0..graph.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);

        loop {
            let (communities, improved) = local_move(&level, resolution, &mut rng);
            if !improved {
                break;
            }

            let (remap, community_count) = dense_remap(&communities);
            for node in membership.iter_mut() {
                *node = remap[&communities[*node]];
            }
            if community_count == level.len() {
                break;
            }
            level = aggregate(&level, &communities, &remap, community_count);
        }

        let labels = graph
            .ids
            .iter()
            .enumerate()
            .map(|(index, entity_id)| (*entity_id, membership[index] as i64))
            .collect::<HashMap<_, _>>();
        let (assignments, cluster_count) = canonicalize_labels(&labels, None);

        let modularity = modularity(&weighted_adjacency(&graph), &membership);

        Ok(ClusterResult {
            algorithm: self.name().to_owned(),
            parameters: json!({
                "resolution": resolution,
                "min_weight": min_weight,
                "random_seed": seed,
            }),
            assignments,
            cluster_count,
            metrics: Some(json!({ "modularity": modularity })),
        })
    }
}

fn weighted_adjacency(graph: &IndexedGraph) -> Vec<HashMap<usize, f64>> {
    let mut adjacency = vec![HashMap::new(); graph.len()];
    for (src, neighbors) in graph.adjacency.iter().enumerate() {
        for (dst, weight) in neighbors {
            *adjacency[src].entry(*dst).or_insert(0.0) += weight;
        }
    }
    adjacency
}

fn degrees(adjacency: &[HashMap<usize, f64>]) -> (Vec<f64>, f64) {
    let mut degree = vec![0.0; adjacency.len()];
    for (node, neighbors) in adjacency.iter().enumerate() {
        for (neighbor, weight) in neighbors {
            degree[node] += weight;
            if *neighbor == node {
                // self loops count twice toward the degree
                degree[node] += weight;
            }
        }
    }
    let total = degree.iter().sum::<f64>();
    (degree, total)
}

fn local_move(
    adjacency: &[HashMap<usize, f64>],
    resolution: f64,
    rng: &mut StdRng,
) -> (Vec<usize>, bool) {
    let node_count = adjacency.len();
    let (degree, total_degree) = degrees(adjacency);
    if total_degree <= 0.0 {
        return ((0..node_count).collect(), false);
    }

    let mut community: Vec<usize> = (0..node_count).collect();
    let mut community_degree = degree.clone();
    let mut improved_overall = false;

    let mut order: Vec<usize> = (0..node_count).collect();
    order.shuffle(rng);

    loop {
        let mut moved = false;
        for &node in &order {
            let current = community[node];
            community_degree[current] -= degree[node];

            let mut weight_to = HashMap::<usize, f64>::new();
            for (neighbor, weight) in &adjacency[node] {
                if *neighbor == node {
                    continue;
                }
                *weight_to.entry(community[*neighbor]).or_insert(0.0) += weight;
            }

            let mut candidates = weight_to.iter().collect::<Vec<_>>();
            candidates.sort_by_key(|(candidate, _)| **candidate);

            let gain_of = |target: usize, link_weight: f64| {
                link_weight - resolution * community_degree[target] * degree[node] / total_degree
            };
            let stay_gain = gain_of(current, weight_to.get(&current).copied().unwrap_or(0.0));

            let mut best = (current, stay_gain);
            for (candidate, link_weight) in candidates {
                let gain = gain_of(*candidate, *link_weight);
                if gain > best.1 + 1e-12 {
                    best = (*candidate, gain);
                }
            }

            community_degree[best.0] += degree[node];
            if best.0 != current {
                community[node] = best.0;
                moved = true;
                improved_overall = true;
            }
        }
        if !moved {
            break;
        }
    }

    (community, improved_overall)
}

fn dense_remap(communities: &[usize]) -> (HashMap<usize, usize>, usize) {
    let mut remap = HashMap::new();
    let mut sorted = communities.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    for (dense, label) in sorted.into_iter().enumerate() {
        remap.insert(label, dense);
    }
    let count = remap.len();
    (remap, count)
}

fn aggregate(
    adjacency: &[HashMap<usize, f64>],
    communities: &[usize],
    remap: &HashMap<usize, usize>,
    community_count: usize,
) -> Vec<HashMap<usize, f64>> {
    let mut aggregated = vec![HashMap::new(); community_count];
    for (node, neighbors) in adjacency.iter().enumerate() {
        let src = remap[&communities[node]];
        for (neighbor, weight) in neighbors {
            let dst = remap[&communities[*neighbor]];
            if src == dst {
                if node <= *neighbor {
                    *aggregated[src].entry(src).or_insert(0.0) += weight;
                }
            } else {
                *aggregated[src].entry(dst).or_insert(0.0) += weight;
            }
        }
    }
    aggregated
}

fn modularity(adjacency: &[HashMap<usize, f64>], membership: &[usize]) -> f64 {
    let (degree, total_degree) = degrees(adjacency);
    if total_degree <= 0.0 {
        return 0.0;
    }

    let mut internal = HashMap::<usize, f64>::new();
    let mut community_degree = HashMap::<usize, f64>::new();
    for (node, neighbors) in adjacency.iter().enumerate() {
        *community_degree.entry(membership[node]).or_insert(0.0) += degree[node];
        for (neighbor, weight) in neighbors {
            if membership[node] == membership[*neighbor] && node <= *neighbor {
                *internal.entry(membership[node]).or_insert(0.0) += weight;
            }
        }
    }

    community_degree
        .iter()
        .map(|(community, community_total)| {
            let inside = internal.get(community).copied().unwrap_or(0.0);
            2.0 * inside / total_degree - (community_total / total_degree).powi(2)
        })
        .sum()
}
