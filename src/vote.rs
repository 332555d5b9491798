//! Breed voting over nearest-neighbor hits.

use crate::index::{IdMap, SearchHit, UNKNOWN_LABEL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How hits sharing a label are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Best single similarity per label.
    #[default]
    Max,
    /// Sum of similarities per label.
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreedCandidate {
    pub breed: String,
    pub breed_raw: String,
    pub score: f32,
    pub rank: usize,
}

/// One row of the per-hit vote table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteRow {
    pub rank: usize,
    pub index: usize,
    pub breed: String,
    pub score: f32,
    pub ref_crop_path: String,
    pub ref_src_path: String,
    pub breed_vote: f32,
}

/// Aggregate scores per raw label, in first-seen order.
#[must_use]
pub fn aggregate(hits: &[SearchHit], id_map: &IdMap, mode: Aggregation) -> Vec<(String, f32)> {
    let mut order: Vec<(String, f32)> = Vec::new();
    let mut slots: HashMap<&str, usize> = HashMap::new();
    for hit in hits {
        let label = id_map.breed(hit.position);
        if let Some(&slot) = slots.get(label) {
            let current = &mut order[slot].1;
            *current = match mode {
                Aggregation::Max => current.max(hit.score),
                Aggregation::Sum => *current + hit.score,
            };
        } else {
            slots.insert(label, order.len());
            order.push((label.to_string(), hit.score));
        }
    }
    order
}

/// Labels ranked by aggregated score, highest first, truncated to `top_k`.
///
/// Equal scores keep the order in which their labels were first hit.
#[must_use]
pub fn rank(hits: &[SearchHit], id_map: &IdMap, mode: Aggregation, top_k: usize) -> Vec<BreedCandidate> {
    let mut scores = aggregate(hits, id_map, mode);
    scores.sort_by(|a, b| b.1.total_cmp(&a.1));
    scores
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(i, (raw, score))| BreedCandidate {
            breed: clean_breed_name(&raw),
            breed_raw: raw,
            score,
            rank: i + 1,
        })
        .collect()
}

/// The single winning label and its score, `("UNKNOWN", 0.0)` with no hits.
#[must_use]
pub fn best(hits: &[SearchHit], id_map: &IdMap, mode: Aggregation) -> (String, f32) {
    rank(hits, id_map, mode, 1)
        .into_iter()
        .next()
        .map_or_else(|| (UNKNOWN_LABEL.to_string(), 0.0), |c| (c.breed_raw, c.score))
}

/// Every hit with its reference paths and its label's aggregated vote,
/// sorted by vote then score, both descending.
#[must_use]
pub fn vote_table(hits: &[SearchHit], id_map: &IdMap, mode: Aggregation) -> Vec<VoteRow> {
    let votes: HashMap<String, f32> = aggregate(hits, id_map, mode).into_iter().collect();
    let mut rows: Vec<VoteRow> = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let entry = id_map.get(hit.position);
            let breed = id_map.breed(hit.position).to_string();
            VoteRow {
                rank: i + 1,
                index: hit.position,
                score: hit.score,
                ref_crop_path: entry.and_then(|e| e.crop_path.clone()).unwrap_or_default(),
                ref_src_path: entry.and_then(|e| e.src_path.clone()).unwrap_or_default(),
                breed_vote: votes.get(&breed).copied().unwrap_or_default(),
                breed,
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.breed_vote
            .total_cmp(&a.breed_vote)
            .then(b.score.total_cmp(&a.score))
    });
    rows
}

/// Turn a dataset label into a display name.
///
/// `n02085620-Chihuahua` → `Chihuahua`, `n02086240-Shih-Tzu` → `Shih Tzu`.
#[must_use]
pub fn clean_breed_name(raw: &str) -> String {
    if raw.is_empty() || raw == UNKNOWN_LABEL {
        return "Unknown".to_string();
    }
    let name = raw.split_once('-').map_or(raw, |(_, rest)| rest);
    name.replace('-', " ")
        .split_whitespace()
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IdEntry;

    fn id_map(labels: &[&str]) -> IdMap {
        IdMap::List(
            labels
                .iter()
                .enumerate()
                .map(|(i, l)| IdEntry {
                    breed: (*l).to_string(),
                    crop_path: Some(format!("crops/{i}.jpg")),
                    src_path: None,
                })
                .collect(),
        )
    }

    fn hits(pairs: &[(usize, f32)]) -> Vec<SearchHit> {
        pairs
            .iter()
            .map(|&(position, score)| SearchHit { position, score })
            .collect()
    }

    #[test]
    fn max_and_sum_disagree_on_winner() {
        let map = id_map(&["husky", "malamute", "malamute", "malamute"]);
        let hits = hits(&[(0, 0.9), (1, 0.8), (2, 0.7), (3, 0.6)]);

        let by_max = rank(&hits, &map, Aggregation::Max, 5);
        assert_eq!(by_max[0].breed_raw, "husky");
        assert_eq!(by_max[1].breed_raw, "malamute");
        assert!((by_max[1].score - 0.8).abs() < 1e-6);
        assert_eq!(by_max[1].rank, 2);

        let (winner, score) = best(&hits, &map, Aggregation::Sum);
        assert_eq!(winner, "malamute");
        assert!((score - 2.1).abs() < 1e-5);
    }

    #[test]
    fn ties_keep_first_seen_order_and_top_k_truncates() {
        let map = id_map(&["b", "a", "c"]);
        let hits = hits(&[(0, 0.5), (1, 0.5), (2, 0.1)]);
        let ranked = rank(&hits, &map, Aggregation::Max, 2);
        let labels: Vec<&str> = ranked.iter().map(|c| c.breed_raw.as_str()).collect();
        assert_eq!(labels, vec!["b", "a"]);
    }

    #[test]
    fn missing_metadata_votes_for_unknown() {
        let map = id_map(&["pug"]);
        let hits = hits(&[(4, 0.9), (0, 0.3)]);
        let ranked = rank(&hits, &map, Aggregation::Max, 5);
        assert_eq!(ranked[0].breed_raw, UNKNOWN_LABEL);
        assert_eq!(ranked[0].breed, "Unknown");
    }

    #[test]
    fn no_hits_means_unknown() {
        let (winner, score) = best(&[], &id_map(&[]), Aggregation::Max);
        assert_eq!(winner, UNKNOWN_LABEL);
        assert!(score.abs() < f32::EPSILON);
        assert!(rank(&[], &id_map(&[]), Aggregation::Sum, 5).is_empty());
    }

    #[test]
    fn vote_table_sorts_by_vote_then_score() {
        let map = id_map(&["husky", "malamute", "malamute"]);
        let hits = hits(&[(0, 0.9), (1, 0.5), (2, 0.6)]);
        let table = vote_table(&hits, &map, Aggregation::Sum);
        let order: Vec<usize> = table.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![2, 1, 0]);
        assert_eq!(table[0].rank, 3);
        assert!((table[0].breed_vote - 1.1).abs() < 1e-6);
        assert_eq!(table[0].ref_crop_path, "crops/2.jpg");
        assert_eq!(table[0].ref_src_path, "");
    }

    #[test]
    fn cleans_dataset_labels() {
        assert_eq!(clean_breed_name("n02085620-Chihuahua"), "Chihuahua");
        assert_eq!(clean_breed_name("n02086240-Shih-Tzu"), "Shih Tzu");
        assert_eq!(clean_breed_name("n02099601-golden_retriever"), "Golden_retriever");
        assert_eq!(clean_breed_name("siamese"), "Siamese");
        assert_eq!(clean_breed_name("BRITISH shorthair"), "British Shorthair");
        assert_eq!(clean_breed_name(UNKNOWN_LABEL), "Unknown");
        assert_eq!(clean_breed_name(""), "Unknown");
    }
}
