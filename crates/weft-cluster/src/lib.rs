use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weft_core::EntityId;

mod components;
mod dbscan;
mod hierarchical;
mod labelprop;
mod louvain;

pub use components::ConnectedComponents;
pub use dbscan::Dbscan;
pub use hierarchical::Hierarchical;
pub use labelprop::LabelPropagation;
pub use louvain::Louvain;

pub const NOISE_CLUSTER: i64 = 0;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unknown clustering algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("invalid parameter '{0}'")]
    InvalidParameter(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterEdge {
    pub src: EntityId,
    pub dst: EntityId,
    pub weight: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterInput {
    pub entities: Vec<EntityId>,
    pub edges: Vec<ClusterEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResult {
    pub algorithm: String,
    pub parameters: serde_json::Value,
    /// Every input entity maps to a cluster id in `1..=cluster_count`,
    /// or to `0` for noise where the algorithm supports it.
    pub assignments: BTreeMap<EntityId, i64>,
    pub cluster_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl ClusterResult {
    pub fn clusters(&self) -> BTreeMap<i64, Vec<EntityId>> {
        let mut clusters = BTreeMap::<i64, Vec<EntityId>>::new();
        for (entity_id, cluster_id) in &self.assignments {
            clusters.entry(*cluster_id).or_default().push(*entity_id);
        }
        clusters
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    pub required: bool,
}

pub trait ClusterAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;
    fn parameter_schema(&self) -> Vec<ParameterSpec>;
    fn run(
        &self,
        input: &ClusterInput,
        params: &serde_json::Value,
    ) -> Result<ClusterResult, ClusterError>;
}

pub struct ClusterRegistry {
    algorithms: BTreeMap<&'static str, Box<dyn ClusterAlgorithm>>,
}

impl ClusterRegistry {
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            algorithms: BTreeMap::new(),
        };
        registry.register(Box::new(ConnectedComponents));
        registry.register(Box::new(Louvain));
        registry.register(Box::new(Hierarchical));
        registry.register(Box::new(Dbscan));
        registry.register(Box::new(LabelPropagation));
        registry
    }

    pub fn register(&mut self, algorithm: Box<dyn ClusterAlgorithm>) {
        self.algorithms.insert(algorithm.name(), algorithm);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.algorithms.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> Result<&dyn ClusterAlgorithm, ClusterError> {
        self.algorithms
            .get(name)
            .map(Box::as_ref)
            .ok_or_else(|| ClusterError::UnknownAlgorithm(name.to_owned()))
    }

    pub fn run(
        &self,
        name: &str,
        input: &ClusterInput,
        params: &serde_json::Value,
    ) -> Result<ClusterResult, ClusterError> {
        let algorithm = self.get(name)?;

        if let Some(object) = params.as_object() {
            let known = algorithm
                .parameter_schema()
                .into_iter()
                .map(|spec| spec.name)
                .collect::<Vec<_>>();
            for key in object.keys() {
                if !known.contains(&key.as_str()) {
                    return Err(ClusterError::InvalidParameter(key.clone()));
                }
            }
        } else if !params.is_null() {
            return Err(ClusterError::InvalidParameter("parameters".to_owned()));
        }

        algorithm.run(input, params)
    }
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

pub(crate) fn f64_param(
    params: &serde_json::Value,
    name: &'static str,
    default: f64,
) -> Result<f64, ClusterError> {
    match params.get(name) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| ClusterError::InvalidParameter(name.to_owned())),
    }
}

pub(crate) fn u64_param(
    params: &serde_json::Value,
    name: &'static str,
    default: u64,
) -> Result<u64, ClusterError> {
    match params.get(name) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| ClusterError::InvalidParameter(name.to_owned())),
    }
}

pub(crate) fn optional_u64_param(
    params: &serde_json::Value,
    name: &'static str,
) -> Result<Option<u64>, ClusterError> {
    match params.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| ClusterError::InvalidParameter(name.to_owned())),
    }
}

pub(crate) fn optional_f64_param(
    params: &serde_json::Value,
    name: &'static str,
) -> Result<Option<f64>, ClusterError> {
    match params.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| ClusterError::InvalidParameter(name.to_owned())),
    }
}

pub(crate) fn str_param<'a>(
    params: &'a serde_json::Value,
    name: &'static str,
    default: &'a str,
) -> Result<&'a str, ClusterError> {
    match params.get(name) {
        None => Ok(default),
        Some(value) => value
            .as_str()
            .ok_or_else(|| ClusterError::InvalidParameter(name.to_owned())),
    }
}

/// Renumbers raw labels into `1..=count` ordered by cluster size (largest
/// first, ties by smallest member id). Entities labeled `noise` become 0.
pub(crate) fn canonicalize_labels(
    labels: &HashMap<EntityId, i64>,
    noise: Option<i64>,
) -> (BTreeMap<EntityId, i64>, i64) {
    let mut members = BTreeMap::<i64, Vec<EntityId>>::new();
    for (entity_id, label) in labels {
        members.entry(*label).or_default().push(*entity_id);
    }

    let mut order = members
        .iter()
        .filter(|(label, _)| noise != Some(**label))
        .map(|(label, entities)| {
            let min_member = entities.iter().min().copied().unwrap_or(EntityId::MAX);
            (*label, entities.len(), min_member)
        })
        .collect::<Vec<_>>();
    order.sort_by(|left, right| {
        right
            .1
            .cmp(&left.1)
            .then_with(|| left.2.cmp(&right.2))
    });

    let renumbered = order
        .iter()
        .enumerate()
        .map(|(index, (label, _, _))| (*label, index as i64 + 1))
        .collect::<HashMap<_, _>>();

    let mut assignments = BTreeMap::new();
    for (entity_id, label) in labels {
        let cluster_id = if noise == Some(*label) {
            NOISE_CLUSTER
        } else {
            renumbered.get(label).copied().unwrap_or(NOISE_CLUSTER)
        };
        assignments.insert(*entity_id, cluster_id);
    }

    (assignments, order.len() as i64)
}

pub(crate) struct IndexedGraph {
    pub ids: Vec<EntityId>,
    pub adjacency: Vec<Vec<(usize, f64)>>,
}

impl IndexedGraph {
    /// Dense-index view over the entities with edges at or above `min_weight`.
    pub fn build(input: &ClusterInput, min_weight: f64) -> Self {
        let mut ids = input.entities.clone();
        ids.sort_unstable();
        ids.dedup();

        let index_of = ids
            .iter()
            .enumerate()
            .map(|(index, entity_id)| (*entity_id, index))
            .collect::<HashMap<_, _>>();

        let mut adjacency = vec![Vec::new(); ids.len()];
        for edge in &input.edges {
            if edge.weight < min_weight || edge.src == edge.dst {
                continue;
            }
            let (Some(&src), Some(&dst)) = (index_of.get(&edge.src), index_of.get(&edge.dst))
            else {
                continue;
            };
            adjacency[src].push((dst, edge.weight));
            adjacency[dst].push((src, edge.weight));
        }
        for neighbors in &mut adjacency {
            neighbors.sort_by(|left, right| left.0.cmp(&right.0));
        }

        Self { ids, adjacency }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}
