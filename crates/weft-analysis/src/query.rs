use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use weft_core::{
    CO_CHANGED, EdgeProperties, EntityId, EntityKind, EntityRecord, Metric, RelationshipRecord,
    SOURCE_GIT,
};
use weft_store::Store;

use crate::AnalysisError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingNeighbor {
    pub entity: EntityRecord,
    pub metric_value: f64,
    pub properties: EdgeProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingGraph {
    pub center: EntityRecord,
    pub nodes: Vec<EntityRecord>,
    pub edges: Vec<RelationshipRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub entity: EntityRecord,
    pub max_coupling: f64,
    pub avg_coupling: f64,
    pub strong_edge_count: i64,
    pub churn: i64,
    pub risk_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HotspotSort {
    #[default]
    Risk,
    Commits,
    Coupling,
    Churn,
}

impl std::str::FromStr for HotspotSort {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "risk" => Ok(Self::Risk),
            "commits" => Ok(Self::Commits),
            "coupling" => Ok(Self::Coupling),
            "churn" => Ok(Self::Churn),
            other => Err(format!(
                "invalid hotspot sort '{other}', expected one of: risk, commits, coupling, churn"
            )),
        }
    }
}

pub fn coupling_for_file(
    store: &Store,
    path: &str,
    metric: Metric,
    min_weight: f64,
    limit: usize,
) -> Result<Vec<CouplingNeighbor>, AnalysisError> {
    let entity = store
        .get_entity_by_name(EntityKind::File, path)?
        .ok_or_else(|| AnalysisError::UnknownFile(path.to_owned()))?;

    let neighbors = store.query_coupling(entity.entity_id, metric, min_weight, limit)?;
    let mut results = Vec::with_capacity(neighbors.len());
    for (neighbor_id, edge) in neighbors {
        let Some(neighbor) = store.get_entity(neighbor_id)? else {
            continue;
        };
        results.push(CouplingNeighbor {
            entity: neighbor,
            metric_value: metric.of(&edge.properties),
            properties: edge.properties,
        });
    }
    Ok(results)
}

pub fn coupling_graph(
    store: &Store,
    path: &str,
    metric: Metric,
    min_weight: f64,
    limit: usize,
) -> Result<CouplingGraph, AnalysisError> {
    let center = store
        .get_entity_by_name(EntityKind::File, path)?
        .ok_or_else(|| AnalysisError::UnknownFile(path.to_owned()))?;

    let neighbors = coupling_for_file(store, path, metric, min_weight, limit)?;
    let mut node_ids = neighbors
        .iter()
        .map(|neighbor| neighbor.entity.entity_id)
        .collect::<HashSet<_>>();
    node_ids.insert(center.entity_id);

    let edges = store
        .list_relationships(SOURCE_GIT, CO_CHANGED)?
        .into_iter()
        .filter(|edge| node_ids.contains(&edge.src) && node_ids.contains(&edge.dst))
        .filter(|edge| metric.of(&edge.properties) >= min_weight)
        .collect::<Vec<_>>();

    Ok(CouplingGraph {
        center: center.clone(),
        nodes: neighbors.into_iter().map(|neighbor| neighbor.entity).collect(),
        edges,
    })
}

/// Hotspots over entities at HEAD: per-entity history metadata joined with
/// aggregate coupling, scored 0-100.
pub fn hotspots(
    store: &Store,
    sort_by: HotspotSort,
    strong_edge_threshold: f64,
    limit: usize,
) -> Result<Vec<Hotspot>, AnalysisError> {
    let entities = store
        .list_entities(EntityKind::File)?
        .into_iter()
        .filter(|entity| entity.exists_at_head)
        .collect::<Vec<_>>();
    if entities.is_empty() {
        return Ok(Vec::new());
    }

    let mut coupling = HashMap::<EntityId, Vec<f64>>::new();
    for edge in store.list_relationships(SOURCE_GIT, CO_CHANGED)? {
        coupling
            .entry(edge.src)
            .or_default()
            .push(edge.properties.jaccard);
        coupling
            .entry(edge.dst)
            .or_default()
            .push(edge.properties.jaccard);
    }

    let mut commit_counts = entities
        .iter()
        .map(|entity| entity.metadata.total_commits)
        .collect::<Vec<_>>();
    commit_counts.sort_unstable();
    let population = commit_counts.len() as f64;

    let mut results = Vec::with_capacity(entities.len());
    for entity in entities {
        let strengths = coupling.get(&entity.entity_id);
        let max_coupling = strengths
            .map(|values| values.iter().copied().fold(0.0f64, f64::max))
            .unwrap_or(0.0);
        let avg_coupling = strengths
            .filter(|values| !values.is_empty())
            .map(|values| values.iter().sum::<f64>() / values.len() as f64)
            .unwrap_or(0.0);
        let strong_edge_count = strengths
            .map(|values| {
                values
                    .iter()
                    .filter(|value| **value >= strong_edge_threshold)
                    .count() as i64
            })
            .unwrap_or(0);

        let rank = commit_counts.partition_point(|count| *count <= entity.metadata.total_commits);
        let commits_percentile = rank as f64 / population;
        let churn = entity.metadata.total_lines_added + entity.metadata.total_lines_deleted;

        let risk_score = (0.3 * commits_percentile * 100.0
            + 0.3 * max_coupling * 100.0
            + (entity.metadata.authors_count as f64 * 5.0).min(20.0)
            + (churn as f64 / 50.0).min(20.0))
        .min(100.0);

        results.push(Hotspot {
            entity,
            max_coupling,
            avg_coupling,
            strong_edge_count,
            churn,
            risk_score,
        });
    }

    results.sort_by(|left, right| {
        let key = |hotspot: &Hotspot| match sort_by {
            HotspotSort::Risk => hotspot.risk_score,
            HotspotSort::Commits => hotspot.entity.metadata.total_commits as f64,
            HotspotSort::Coupling => hotspot.max_coupling,
            HotspotSort::Churn => hotspot.churn as f64,
        };
        key(right)
            .partial_cmp(&key(left))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.entity.qualified_name.cmp(&right.entity.qualified_name))
    });
    results.truncate(limit);
    Ok(results)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEdge {
    pub src_component: String,
    pub dst_component: String,
    pub pair_count: f64,
}

/// Rolls file pairs up to path components truncated at `depth` segments.
/// Pairs that collapse into the same component are dropped.
pub fn aggregate_components(
    store: &Store,
    depth: u32,
    min_component_cooccurrence: u32,
) -> Result<Vec<ComponentEdge>, AnalysisError> {
    let names = store
        .list_entities(EntityKind::File)?
        .into_iter()
        .map(|entity| (entity.entity_id, entity.qualified_name))
        .collect::<HashMap<_, _>>();

    let mut aggregated = BTreeMap::<(String, String), f64>::new();
    for edge in store.list_relationships(SOURCE_GIT, CO_CHANGED)? {
        let (Some(src_name), Some(dst_name)) = (names.get(&edge.src), names.get(&edge.dst)) else {
            continue;
        };
        let src_component = component_of(src_name, depth);
        let dst_component = component_of(dst_name, depth);
        if src_component == dst_component {
            continue;
        }

        let key = if src_component <= dst_component {
            (src_component, dst_component)
        } else {
            (dst_component, src_component)
        };
        *aggregated.entry(key).or_insert(0.0) += edge.properties.pair_count;
    }

    let mut edges = aggregated
        .into_iter()
        .filter(|(_, pair_count)| *pair_count >= f64::from(min_component_cooccurrence))
        .map(|((src_component, dst_component), pair_count)| ComponentEdge {
            src_component,
            dst_component,
            pair_count,
        })
        .collect::<Vec<_>>();
    edges.sort_by(|left, right| {
        right
            .pair_count
            .partial_cmp(&left.pair_count)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.src_component.cmp(&right.src_component))
            .then_with(|| left.dst_component.cmp(&right.dst_component))
    });
    Ok(edges)
}

fn component_of(path: &str, depth: u32) -> String {
    let segments = path.split('/').collect::<Vec<_>>();
    if segments.len() <= 1 {
        return path.to_owned();
    }
    let keep = (segments.len() - 1).min(depth as usize);
    segments[..keep].join("/")
}
