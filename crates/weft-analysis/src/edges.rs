use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use weft_core::{
    AnalysisConfig, CO_CHANGED, EdgeProperties, EntityId, RelationshipRecord, SOURCE_GIT,
};

use crate::Transaction;

/// Weighted pair counting over the transaction sequence, metric computation,
/// and top-K retention per endpoint. Pair keys are canonical `(min, max)`.
pub fn build_edges(
    transactions: &[Transaction],
    eligible: &BTreeSet<EntityId>,
    config: &AnalysisConfig,
) -> Vec<RelationshipRecord> {
    let mut pair_weight = BTreeMap::<(EntityId, EntityId), f64>::new();
    let mut file_count = HashMap::<EntityId, i64>::new();
    let mut file_weight = HashMap::<EntityId, f64>::new();

    let max_changeset = config.max_changeset_size as usize;
    for transaction in transactions {
        let files = transaction
            .files
            .iter()
            .copied()
            .filter(|entity_id| eligible.contains(entity_id))
            .collect::<Vec<_>>();
        if files.len() < 2 {
            continue;
        }

        let mut weight = transaction.weight;
        if files.len() > max_changeset {
            // log-dampening keeps sweeping changesets from dominating
            weight *= 1.0 / (1.0 + files.len() as f64).ln();
        }

        for left_idx in 0..files.len() {
            for right_idx in (left_idx + 1)..files.len() {
                *pair_weight
                    .entry((files[left_idx], files[right_idx]))
                    .or_insert(0.0) += weight;
            }
        }
        for entity_id in &files {
            *file_count.entry(*entity_id).or_insert(0) += 1;
            *file_weight.entry(*entity_id).or_insert(0.0) += weight;
        }
    }

    let min_cooccurrence = f64::from(config.min_cooccurrence);
    let mut edges = Vec::new();
    for ((src, dst), pair_count) in pair_weight {
        if pair_count < min_cooccurrence {
            continue;
        }

        let src_count = file_count.get(&src).copied().unwrap_or(0);
        let dst_count = file_count.get(&dst).copied().unwrap_or(0);
        let src_weight = file_weight.get(&src).copied().unwrap_or(0.0);
        let dst_weight = file_weight.get(&dst).copied().unwrap_or(0.0);

        let jaccard = pair_count / ((src_count + dst_count) as f64 - pair_count);
        let jaccard_weighted = pair_count / (src_weight + dst_weight - pair_count);

        edges.push(RelationshipRecord {
            source_type: SOURCE_GIT.to_owned(),
            rel_kind: CO_CHANGED.to_owned(),
            src,
            dst,
            weight: jaccard,
            properties: EdgeProperties {
                pair_count,
                jaccard,
                jaccard_weighted,
                p_dst_given_src: pair_count / src_count as f64,
                p_src_given_dst: pair_count / dst_count as f64,
                src_count,
                dst_count,
            },
        });
    }

    retain_top_k(edges, config.topk_edges_per_file as usize)
}

/// A pair survives when it ranks in the top K of either endpoint, ordered by
/// jaccard, then pair count, then the canonical key. Applying the retention
/// twice is a no-op.
pub(crate) fn retain_top_k(
    edges: Vec<RelationshipRecord>,
    k: usize,
) -> Vec<RelationshipRecord> {
    let mut incident = HashMap::<EntityId, Vec<usize>>::new();
    for (index, edge) in edges.iter().enumerate() {
        incident.entry(edge.src).or_default().push(index);
        incident.entry(edge.dst).or_default().push(index);
    }

    let mut retained = HashSet::new();
    for indices in incident.values_mut() {
        indices.sort_by(|left, right| {
            let left_edge = &edges[*left];
            let right_edge = &edges[*right];
            right_edge
                .properties
                .jaccard
                .partial_cmp(&left_edge.properties.jaccard)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    right_edge
                        .properties
                        .pair_count
                        .partial_cmp(&left_edge.properties.pair_count)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    (left_edge.src, left_edge.dst).cmp(&(right_edge.src, right_edge.dst))
                })
        });
        retained.extend(indices.iter().take(k).copied());
    }

    let mut survivors = edges
        .into_iter()
        .enumerate()
        .filter(|(index, _)| retained.contains(index))
        .map(|(_, edge)| edge)
        .collect::<Vec<_>>();
    survivors.sort_by_key(|edge| (edge.src, edge.dst));
    survivors
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use weft_core::AnalysisConfig;

    use super::*;
    use crate::Transaction;

    fn transaction(files: &[i64], weight: f64, ts: i64) -> Transaction {
        Transaction {
            files: files.iter().copied().collect::<BTreeSet<_>>(),
            weight,
            ts,
        }
    }

    fn repeated(files: &[i64], times: usize) -> Vec<Transaction> {
        (0..times)
            .map(|index| transaction(files, 1.0, index as i64))
            .collect()
    }

    fn eligible(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn jaccard_matches_the_closed_form() {
        // 10 × {engine, utils}, 10 × {engine, test_engine}, 10 × {utils, test_utils},
        // 5 × {routes, handlers}
        let mut transactions = repeated(&[1, 2], 10);
        transactions.extend(repeated(&[1, 3], 10));
        transactions.extend(repeated(&[2, 4], 10));
        transactions.extend(repeated(&[5, 6], 5));

        let config = AnalysisConfig {
            max_changeset_size: 10,
            ..AnalysisConfig::default()
        };
        let edges = build_edges(&transactions, &eligible(&[1, 2, 3, 4, 5, 6]), &config);

        let engine_utils = edges
            .iter()
            .find(|edge| (edge.src, edge.dst) == (1, 2))
            .expect("engine-utils edge");
        assert!((engine_utils.properties.jaccard - 10.0 / 30.0).abs() < 1e-9);
        assert!((engine_utils.properties.jaccard_weighted - 10.0 / 30.0).abs() < 1e-9);
        assert_eq!(engine_utils.properties.pair_count, 10.0);
        assert_eq!(engine_utils.properties.src_count, 20);
        assert_eq!(engine_utils.properties.dst_count, 20);
        assert!((engine_utils.properties.p_dst_given_src - 0.5).abs() < 1e-9);

        let routes_handlers = edges
            .iter()
            .find(|edge| (edge.src, edge.dst) == (5, 6))
            .expect("routes-handlers edge");
        assert!((routes_handlers.properties.jaccard - 1.0).abs() < 1e-9);
    }

    #[test]
    fn conditional_probabilities_are_directional() {
        // 1 changes in 10 transactions, 2 only alongside 1 in 5 of them
        let mut transactions = repeated(&[1, 2], 5);
        transactions.extend(repeated(&[1, 3], 5));

        let config = AnalysisConfig::default();
        let edges = build_edges(&transactions, &eligible(&[1, 2, 3]), &config);

        let edge = edges
            .iter()
            .find(|edge| (edge.src, edge.dst) == (1, 2))
            .expect("edge");
        assert!((edge.properties.p_dst_given_src - 0.5).abs() < 1e-9);
        assert!((edge.properties.p_src_given_dst - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pairs_below_min_cooccurrence_are_dropped() {
        let transactions = repeated(&[1, 2], 4);
        let config = AnalysisConfig::default();
        let edges = build_edges(&transactions, &eligible(&[1, 2]), &config);
        assert!(edges.is_empty());
    }

    #[test]
    fn ineligible_files_never_pair() {
        let mut transactions = repeated(&[1, 2], 10);
        transactions.extend(repeated(&[1, 9], 10));

        let config = AnalysisConfig::default();
        let edges = build_edges(&transactions, &eligible(&[1, 2]), &config);

        assert!(edges.iter().all(|edge| edge.src != 9 && edge.dst != 9));
        let edge = &edges[0];
        // transactions reduced to a single eligible file contribute nothing
        assert_eq!(edge.properties.src_count, 10);
    }

    #[test]
    fn wide_logical_transactions_are_dampened() {
        let files = (1..=20).collect::<Vec<i64>>();
        let transactions = repeated(&files, 10);
        let config = AnalysisConfig {
            max_changeset_size: 10,
            min_cooccurrence: 1,
            ..AnalysisConfig::default()
        };

        let edges = build_edges(&transactions, &eligible(&files), &config);
        let edge = &edges[0];
        let expected = 10.0 / (21.0f64).ln();
        assert!((edge.properties.pair_count - expected).abs() < 1e-9);
    }

    #[test]
    fn removing_a_transaction_never_increases_counts() {
        let transactions = repeated(&[1, 2], 10);
        let config = AnalysisConfig {
            min_cooccurrence: 1,
            ..AnalysisConfig::default()
        };

        let full = build_edges(&transactions, &eligible(&[1, 2]), &config);
        let reduced = build_edges(&transactions[..9], &eligible(&[1, 2]), &config);
        assert!(reduced[0].properties.pair_count < full[0].properties.pair_count);
    }

    #[test]
    fn top_k_keeps_a_pair_in_either_endpoints_list() {
        // hub 1 couples with 2..=4; the weakest hub edge still survives via its
        // other endpoint, which has no stronger edge
        let mut transactions = Vec::new();
        transactions.extend(repeated(&[1, 2], 30));
        transactions.extend(repeated(&[1, 3], 20));
        transactions.extend(repeated(&[1, 4], 10));

        let config = AnalysisConfig {
            topk_edges_per_file: 2,
            min_cooccurrence: 1,
            ..AnalysisConfig::default()
        };
        let edges = build_edges(&transactions, &eligible(&[1, 2, 3, 4]), &config);

        assert_eq!(edges.len(), 3);
        assert!(edges.iter().any(|edge| (edge.src, edge.dst) == (1, 4)));
    }

    #[test]
    fn top_k_retention_is_idempotent() {
        let mut transactions = Vec::new();
        for other in 2..=8 {
            transactions.extend(repeated(&[1, other], other as usize));
        }
        let config = AnalysisConfig {
            topk_edges_per_file: 3,
            min_cooccurrence: 1,
            ..AnalysisConfig::default()
        };

        let edges = build_edges(&transactions, &eligible(&(1..=8).collect::<Vec<_>>()), &config);
        let again = retain_top_k(edges.clone(), 3);
        assert_eq!(edges, again);
    }

    #[test]
    fn keys_are_canonical_and_irreflexive() {
        let transactions = repeated(&[5, 3, 9], 6);
        let config = AnalysisConfig {
            min_cooccurrence: 1,
            ..AnalysisConfig::default()
        };
        let edges = build_edges(&transactions, &eligible(&[3, 5, 9]), &config);

        assert_eq!(edges.len(), 3);
        for edge in &edges {
            assert!(edge.src < edge.dst);
        }
    }
}
