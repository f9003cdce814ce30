//! Post-processing of raw clusters into usable units.
//!
//! Filters clusters by size, scores internal coherence, extracts keywords,
//! and accounts for every input chunk: each one lands in exactly one
//! surviving cluster or in the `unclustered` list, never both, never
//! neither.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::chunks::Chunk;
use crate::config::ClusteringConfig;

use super::engine::RawClusters;
use super::similarity::cosine_similarity;

/// Keywords per cluster are capped at this many.
const MAX_KEYWORDS: usize = 10;

/// Minimum token length for keyword candidates (characters).
const MIN_KEYWORD_LENGTH: usize = 4;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "this", "that", "these", "those", "with", "from", "into", "onto", "over", "under",
        "have", "been", "being", "were", "will", "would", "should", "could", "them", "they",
        "their", "there", "here", "when", "where", "which", "what", "while", "than", "then",
        "also", "such", "some", "more", "most", "other", "only", "very", "your", "each",
        "about", "after", "before", "between", "because", "does", "doing",
    ]
    .into_iter()
    .collect()
});

/// A post-processed cluster, read-only afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    pub member_chunk_ids: Vec<String>,
    pub centroid: Vec<f32>,
    pub size: usize,
    /// Mean pairwise cosine similarity among members, 1.0 for singletons.
    pub coherence_score: f32,
    pub keywords: Vec<String>,
}

/// Summary statistics over a post-processing run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatistics {
    pub total_chunks: usize,
    pub clustered_chunks: usize,
    pub cluster_count: usize,
    pub unclustered_count: usize,
    pub average_cluster_size: f32,
}

/// The complete clustering result: surviving clusters, the assignment map,
/// unclustered chunk ids and statistics. Persisted as `clusters.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSet {
    pub clusters: Vec<Cluster>,
    /// Chunk id -> index into `clusters`.
    pub assignments: HashMap<String, usize>,
    pub unclustered: Vec<String>,
    pub statistics: ClusterStatistics,
}

/// Filter, score and summarize raw clusters.
///
/// Clusters outside `[min_cluster_size, max_cluster_size]` are discarded and
/// their members moved to `unclustered`, together with DBSCAN noise and
/// chunks skipped during embedding.
pub fn post_process(raw: &RawClusters, chunks: &[Chunk], config: &ClusteringConfig) -> ClusterSet {
    let by_id: HashMap<&str, &Chunk> = chunks.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut clusters = Vec::new();
    let mut assignments = HashMap::new();
    let mut unclustered: Vec<String> = Vec::new();

    for raw_cluster in &raw.clusters {
        let size = raw_cluster.member_ids.len();
        if size < config.min_cluster_size || size > config.max_cluster_size {
            unclustered.extend(raw_cluster.member_ids.iter().cloned());
            continue;
        }

        let index = clusters.len();
        for member in &raw_cluster.member_ids {
            assignments.insert(member.clone(), index);
        }

        clusters.push(Cluster {
            id: format!("c{index:03}"),
            member_chunk_ids: raw_cluster.member_ids.clone(),
            centroid: raw_cluster.centroid.clone(),
            size,
            coherence_score: coherence(&raw_cluster.member_ids, &raw.embeddings),
            keywords: extract_keywords(&raw_cluster.member_ids, &by_id),
        });
    }

    unclustered.extend(raw.noise.iter().cloned());
    unclustered.extend(raw.skipped.iter().cloned());

    let clustered_chunks: usize = clusters.iter().map(|c| c.size).sum();
    let statistics = ClusterStatistics {
        total_chunks: chunks.len(),
        clustered_chunks,
        cluster_count: clusters.len(),
        unclustered_count: unclustered.len(),
        average_cluster_size: if clusters.is_empty() {
            0.0
        } else {
            clustered_chunks as f32 / clusters.len() as f32
        },
    };

    log::debug!(
        "post-processing kept {} clusters, {} chunks unclustered",
        statistics.cluster_count,
        statistics.unclustered_count
    );

    ClusterSet {
        clusters,
        assignments,
        unclustered,
        statistics,
    }
}

/// Mean pairwise cosine similarity across all member pairs.
/// Singleton clusters score 1.0 by convention.
fn coherence(member_ids: &[String], embeddings: &HashMap<String, Vec<f32>>) -> f32 {
    if member_ids.len() < 2 {
        return 1.0;
    }

    let vectors: Vec<&[f32]> = member_ids
        .iter()
        .filter_map(|id| embeddings.get(id).map(|v| v.as_slice()))
        .collect();
    if vectors.len() < 2 {
        return 1.0;
    }

    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            total += cosine_similarity(vectors[i], vectors[j]);
            pairs += 1;
        }
    }

    total / pairs as f32
}

/// Top term-frequency tokens shared across enough member chunks.
///
/// A token qualifies when it is at least [`MIN_KEYWORD_LENGTH`] characters,
/// not a stop word, and appears in at least `max(2, ceil(0.3 * size))`
/// member chunks. Qualifying tokens are ordered by total frequency
/// descending (ties alphabetical) and capped at [`MAX_KEYWORDS`].
fn extract_keywords(member_ids: &[String], by_id: &HashMap<&str, &Chunk>) -> Vec<String> {
    let size = member_ids.len();
    let min_documents = 2.max((0.3 * size as f32).ceil() as usize);

    let mut term_frequency: HashMap<String, usize> = HashMap::new();
    let mut document_frequency: HashMap<String, usize> = HashMap::new();

    for id in member_ids {
        let Some(chunk) = by_id.get(id.as_str()) else {
            continue;
        };

        let mut seen_in_chunk: HashSet<String> = HashSet::new();
        for token in tokenize(&chunk.text) {
            *term_frequency.entry(token.clone()).or_insert(0) += 1;
            if seen_in_chunk.insert(token.clone()) {
                *document_frequency.entry(token).or_insert(0) += 1;
            }
        }
    }

    let mut keywords: Vec<(String, usize)> = term_frequency
        .into_iter()
        .filter(|(token, _)| document_frequency.get(token).copied().unwrap_or(0) >= min_documents)
        .collect();

    keywords.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    keywords.truncate(MAX_KEYWORDS);
    keywords.into_iter().map(|(token, _)| token).collect()
}

/// Lowercase alphanumeric tokens of keyword-worthy length.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.len() >= MIN_KEYWORD_LENGTH && !STOP_WORDS.contains(s.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::engine::RawCluster;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn raw(clusters: Vec<(Vec<&str>, Vec<f32>)>, embeddings: Vec<(&str, Vec<f32>)>) -> RawClusters {
        RawClusters {
            clusters: clusters
                .into_iter()
                .map(|(ids, centroid)| RawCluster {
                    member_ids: ids.into_iter().map(String::from).collect(),
                    centroid,
                })
                .collect(),
            embeddings: embeddings
                .into_iter()
                .map(|(id, v)| (id.to_string(), v))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_size_filter_moves_members_to_unclustered() {
        let chunks = vec![
            chunk("a", "rust memory safety"),
            chunk("b", "rust borrow checker"),
            chunk("c", "lonely chunk"),
        ];
        let raw = raw(
            vec![
                (vec!["a", "b"], vec![1.0, 0.0]),
                (vec!["c"], vec![0.0, 1.0]),
            ],
            vec![
                ("a", vec![1.0, 0.0]),
                ("b", vec![1.0, 0.1]),
                ("c", vec![0.0, 1.0]),
            ],
        );

        let config = ClusteringConfig::default(); // min_cluster_size = 2
        let set = post_process(&raw, &chunks, &config);

        assert_eq!(set.clusters.len(), 1);
        assert_eq!(set.unclustered, vec!["c".to_string()]);
        assert_eq!(set.assignments.len(), 2);
        assert_eq!(set.assignments["a"], 0);
        assert_eq!(set.assignments["b"], 0);
        assert!(!set.assignments.contains_key("c"));
    }

    #[test]
    fn test_every_chunk_accounted_for() {
        let chunks = vec![
            chunk("a", "one"),
            chunk("b", "two"),
            chunk("c", "three"),
            chunk("d", "four"),
        ];
        let mut raw = raw(
            vec![
                (vec!["a", "b"], vec![1.0, 0.0]),
                (vec!["c"], vec![0.0, 1.0]),
            ],
            vec![
                ("a", vec![1.0, 0.0]),
                ("b", vec![1.0, 0.1]),
                ("c", vec![0.0, 1.0]),
            ],
        );
        raw.skipped = vec!["d".to_string()];

        let config = ClusteringConfig::default();
        let set = post_process(&raw, &chunks, &config);

        let mut accounted: Vec<&str> = set
            .clusters
            .iter()
            .flat_map(|c| c.member_chunk_ids.iter().map(String::as_str))
            .chain(set.unclustered.iter().map(String::as_str))
            .collect();
        accounted.sort_unstable();
        assert_eq!(accounted, vec!["a", "b", "c", "d"]);
        assert_eq!(set.statistics.total_chunks, 4);
        assert_eq!(set.statistics.clustered_chunks, 2);
        assert_eq!(set.statistics.unclustered_count, 2);
    }

    #[test]
    fn test_coherence_identical_vectors_is_one() {
        let chunks = vec![chunk("a", "x"), chunk("b", "y")];
        let raw = raw(
            vec![(vec!["a", "b"], vec![1.0, 0.0])],
            vec![("a", vec![1.0, 0.0]), ("b", vec![1.0, 0.0])],
        );

        let set = post_process(&raw, &chunks, &ClusteringConfig::default());
        assert!((set.clusters[0].coherence_score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_coherence_singleton_is_one() {
        let chunks = vec![chunk("a", "x")];
        let raw = raw(
            vec![(vec!["a"], vec![1.0, 0.0])],
            vec![("a", vec![1.0, 0.0])],
        );

        let mut config = ClusteringConfig::default();
        config.min_cluster_size = 1;
        let set = post_process(&raw, &chunks, &config);
        assert_eq!(set.clusters[0].coherence_score, 1.0);
        // the document-frequency floor of 2 means singletons get no keywords
        assert!(set.clusters[0].keywords.is_empty());
    }

    #[test]
    fn test_keywords_require_shared_document_frequency() {
        let chunks = vec![
            chunk("a", "ownership rules in rust memory model"),
            chunk("b", "memory ownership transfer semantics"),
            chunk("c", "unrelated gardening tips"),
        ];
        let raw = raw(
            vec![(vec!["a", "b", "c"], vec![1.0])],
            vec![
                ("a", vec![1.0]),
                ("b", vec![1.0]),
                ("c", vec![1.0]),
            ],
        );

        let set = post_process(&raw, &chunks, &ClusteringConfig::default());
        let keywords = &set.clusters[0].keywords;

        // "ownership" and "memory" appear in 2 of 3 chunks (>= max(2, 1))
        assert!(keywords.contains(&"ownership".to_string()));
        assert!(keywords.contains(&"memory".to_string()));
        // "gardening" appears in only one chunk
        assert!(!keywords.contains(&"gardening".to_string()));
        // "in" is below the length floor
        assert!(!keywords.contains(&"in".to_string()));
    }

    #[test]
    fn test_keywords_sorted_by_frequency_then_alphabetical() {
        let chunks = vec![
            chunk("a", "alpha alpha beta gamma"),
            chunk("b", "alpha beta gamma"),
        ];
        let raw = raw(
            vec![(vec!["a", "b"], vec![1.0])],
            vec![("a", vec![1.0]), ("b", vec![1.0])],
        );

        let set = post_process(&raw, &chunks, &ClusteringConfig::default());
        // alpha: tf 3; beta/gamma: tf 2, tie broken alphabetically
        assert_eq!(set.clusters[0].keywords, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_keywords_capped_at_ten() {
        let text = "aaaa bbbb cccc dddd eeee ffff gggg hhhh iiii jjjj kkkk llll";
        let chunks = vec![chunk("a", text), chunk("b", text)];
        let raw = raw(
            vec![(vec!["a", "b"], vec![1.0])],
            vec![("a", vec![1.0]), ("b", vec![1.0])],
        );

        let set = post_process(&raw, &chunks, &ClusteringConfig::default());
        assert_eq!(set.clusters[0].keywords.len(), 10);
    }

    #[test]
    fn test_statistics_average_size() {
        let chunks = vec![
            chunk("a", "1"),
            chunk("b", "2"),
            chunk("c", "3"),
            chunk("d", "4"),
            chunk("e", "5"),
        ];
        let raw = raw(
            vec![
                (vec!["a", "b", "c"], vec![1.0]),
                (vec!["d", "e"], vec![1.0]),
            ],
            vec![
                ("a", vec![1.0]),
                ("b", vec![1.0]),
                ("c", vec![1.0]),
                ("d", vec![1.0]),
                ("e", vec![1.0]),
            ],
        );

        let set = post_process(&raw, &chunks, &ClusteringConfig::default());
        assert_eq!(set.statistics.cluster_count, 2);
        assert!((set.statistics.average_cluster_size - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_cluster_ids_are_ordinal() {
        let chunks = vec![chunk("a", "1"), chunk("b", "2"), chunk("c", "3"), chunk("d", "4")];
        let raw = raw(
            vec![
                (vec!["a", "b"], vec![1.0]),
                (vec!["c", "d"], vec![1.0]),
            ],
            vec![
                ("a", vec![1.0]),
                ("b", vec![1.0]),
                ("c", vec![1.0]),
                ("d", vec![1.0]),
            ],
        );

        let set = post_process(&raw, &chunks, &ClusteringConfig::default());
        assert_eq!(set.clusters[0].id, "c000");
        assert_eq!(set.clusters[1].id, "c001");
    }
}
