//! Clustering engine: hierarchical agglomerative and DBSCAN.
//!
//! Both algorithms run over a precomputed pairwise cosine-similarity matrix
//! and are deterministic for identical input order and parameters: candidate
//! scans walk indices in stable order and only a strictly better score
//! replaces the current best, so ties resolve to the earliest pair.
//!
//! Scaling limit: hierarchical merging is O(n²) per step and O(n³) worst
//! case overall. That is acceptable for the bounded catalogs this engine
//! targets (tens to low hundreds of chunks) and intentionally not hidden
//! behind an approximate method.

use std::collections::{HashMap, VecDeque};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::chunks::Chunk;
use crate::config::ClusteringConfig;
use crate::embedding::EmbeddingProvider;

use super::similarity::{centroid, cosine_similarity};
use super::{ProgressFn, ProgressReport, ProgressStage};

/// Clustering algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Hierarchical,
    Dbscan,
}

/// Rule for computing inter-cluster similarity during hierarchical merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Maximum pairwise similarity between members.
    Single,
    /// Minimum pairwise similarity between members.
    Complete,
    /// Mean pairwise similarity between members.
    #[default]
    Average,
}

/// A cluster as produced by the engine, before post-processing.
#[derive(Debug, Clone)]
pub struct RawCluster {
    pub member_ids: Vec<String>,
    pub centroid: Vec<f32>,
}

/// Engine output: raw clusters plus the chunks that did not make it in.
#[derive(Debug, Clone, Default)]
pub struct RawClusters {
    pub clusters: Vec<RawCluster>,
    /// DBSCAN noise bucket; always empty for hierarchical clustering.
    pub noise: Vec<String>,
    /// Chunks excluded because embedding them failed.
    pub skipped: Vec<String>,
    /// Merge steps (hierarchical) or seed points processed (DBSCAN).
    pub iterations: usize,
    /// Usable embedding per admitted chunk id, including embeddings the
    /// engine generated itself. Post-processing scores coherence from these.
    pub embeddings: HashMap<String, Vec<f32>>,
}

/// Report clustering progress every this many iterations.
const CLUSTERING_PROGRESS_INTERVAL: usize = 50;
/// Report embedding progress every this many embedded chunks.
const EMBEDDING_PROGRESS_INTERVAL: usize = 10;

/// Groups chunks into clusters of semantically similar members.
pub struct ClusteringEngine<'a> {
    provider: &'a dyn EmbeddingProvider,
    config: ClusteringConfig,
}

/// A chunk admitted to clustering: id plus a usable embedding.
struct Point {
    id: String,
    embedding: Vec<f32>,
}

impl<'a> ClusteringEngine<'a> {
    /// Create an engine. Fails fast on invalid configuration.
    pub fn new(
        provider: &'a dyn EmbeddingProvider,
        config: ClusteringConfig,
    ) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        Ok(Self { provider, config })
    }

    /// Cluster the given chunks.
    ///
    /// Chunks without an embedding are embedded through the provider first;
    /// a per-chunk failure (or a dimension mismatch) is logged and the chunk
    /// excluded, degrading the result instead of failing it.
    pub fn cluster(&self, chunks: &[Chunk], progress: Option<&ProgressFn>) -> RawClusters {
        let (points, skipped) = self.embed_chunks(chunks, progress);

        if points.is_empty() {
            if !skipped.is_empty() {
                log::warn!("no chunks with usable embeddings, nothing to cluster");
            }
            return RawClusters {
                skipped,
                ..Default::default()
            };
        }

        let matrix = similarity_matrix(&points);
        let point_count = points.len();

        let mut result = match self.config.algorithm {
            Algorithm::Hierarchical => self.hierarchical(&points, &matrix, progress),
            Algorithm::Dbscan => self.dbscan(&points, &matrix, progress),
        };
        result.skipped = skipped;
        result.embeddings = points.into_iter().map(|p| (p.id, p.embedding)).collect();

        log::info!(
            "clustered {} chunks into {} clusters ({} noise, {} skipped, {} iterations)",
            point_count,
            result.clusters.len(),
            result.noise.len(),
            result.skipped.len(),
            result.iterations
        );

        result
    }

    /// Collect usable (id, embedding) points, embedding missing chunks
    /// through the provider.
    fn embed_chunks(
        &self,
        chunks: &[Chunk],
        progress: Option<&ProgressFn>,
    ) -> (Vec<Point>, Vec<String>) {
        let expected = self.provider.dimensions();
        let to_embed = chunks.iter().filter(|c| c.embedding.is_none()).count();
        let mut embedded = 0usize;

        let mut points = Vec::with_capacity(chunks.len());
        let mut skipped = Vec::new();

        for chunk in chunks {
            let embedding = match &chunk.embedding {
                Some(vector) => {
                    if vector.len() != expected {
                        log::warn!(
                            "chunk '{}': embedding has {} dimensions, expected {}, excluding",
                            chunk.id,
                            vector.len(),
                            expected
                        );
                        skipped.push(chunk.id.clone());
                        continue;
                    }
                    vector.clone()
                }
                None => {
                    let result = self.provider.embed(&chunk.text);
                    embedded += 1;
                    if embedded % EMBEDDING_PROGRESS_INTERVAL == 0 || embedded == to_embed {
                        if let Some(report) = progress {
                            report(ProgressReport::new(
                                ProgressStage::Embeddings,
                                embedded,
                                to_embed,
                            ));
                        }
                    }
                    match result {
                        Ok(vector) => vector,
                        Err(err) => {
                            log::warn!("chunk '{}': embedding failed ({err}), excluding", chunk.id);
                            skipped.push(chunk.id.clone());
                            continue;
                        }
                    }
                }
            };

            points.push(Point {
                id: chunk.id.clone(),
                embedding,
            });
        }

        (points, skipped)
    }

    /// Hierarchical agglomerative clustering.
    ///
    /// Starts with one cluster per point and repeatedly merges the most
    /// similar pair (by the configured linkage) until the best remaining
    /// similarity falls below the threshold, with two guards: merging keeps
    /// going while the cluster count still exceeds `max_clusters`, and the
    /// loop is hard-capped at 2x the point count.
    fn hierarchical(
        &self,
        points: &[Point],
        matrix: &[Vec<f32>],
        progress: Option<&ProgressFn>,
    ) -> RawClusters {
        let threshold = self.config.similarity_threshold;
        let max_iterations = points.len() * 2;
        let max_merges = points.len().saturating_sub(1);

        // members hold indices into `points`
        let mut clusters: Vec<Vec<usize>> = (0..points.len()).map(|i| vec![i]).collect();
        let mut iterations = 0usize;

        while clusters.len() > 1 {
            if iterations >= max_iterations {
                log::warn!(
                    "hierarchical merge cap of {} iterations hit, returning current clustering",
                    max_iterations
                );
                break;
            }

            let mut best: Option<(usize, usize, f32)> = None;
            for i in 0..clusters.len() {
                for j in (i + 1)..clusters.len() {
                    let score = self.linkage_similarity(&clusters[i], &clusters[j], matrix);
                    if best.map_or(true, |(_, _, current)| score > current) {
                        best = Some((i, j, score));
                    }
                }
            }

            let (i, j, score) = match best {
                Some(found) => found,
                None => break,
            };

            let over_cap = clusters.len() > self.config.max_clusters;
            if score < threshold && !over_cap {
                break;
            }

            let merged = clusters.remove(j);
            clusters[i].extend(merged);
            iterations += 1;

            if iterations % CLUSTERING_PROGRESS_INTERVAL == 0 {
                if let Some(report) = progress {
                    report(ProgressReport::new(
                        ProgressStage::Clustering,
                        iterations,
                        max_merges,
                    ));
                }
            }
        }

        if let Some(report) = progress {
            report(ProgressReport::new(
                ProgressStage::Clustering,
                max_merges,
                max_merges,
            ));
        }

        RawClusters {
            clusters: clusters
                .into_iter()
                .map(|members| build_cluster(points, members))
                .collect(),
            noise: Vec::new(),
            skipped: Vec::new(),
            iterations,
            embeddings: HashMap::new(),
        }
    }

    /// Inter-cluster similarity under the configured linkage.
    fn linkage_similarity(&self, a: &[usize], b: &[usize], matrix: &[Vec<f32>]) -> f32 {
        let pairs = a.iter().flat_map(|&i| b.iter().map(move |&j| matrix[i][j]));

        match self.config.linkage {
            Linkage::Single => pairs.fold(f32::NEG_INFINITY, f32::max),
            Linkage::Complete => pairs.fold(f32::INFINITY, f32::min),
            Linkage::Average => {
                let count = (a.len() * b.len()) as f32;
                pairs.sum::<f32>() / count
            }
        }
    }

    /// Density-based clustering over 1 - cosine similarity.
    ///
    /// Neighbor sets include the point itself, so the default
    /// `min_points = 2` lets a close pair form a cluster. Noise points
    /// reached during expansion are promoted to border members.
    fn dbscan(
        &self,
        points: &[Point],
        matrix: &[Vec<f32>],
        progress: Option<&ProgressFn>,
    ) -> RawClusters {
        #[derive(Clone, Copy, PartialEq)]
        enum Label {
            Unvisited,
            Noise,
            Member(usize),
        }

        let epsilon = self.config.dbscan_epsilon;
        let min_points = self.config.dbscan_min_points;
        let n = points.len();

        let neighbors = |i: usize| -> Vec<usize> {
            (0..n).filter(|&j| 1.0 - matrix[i][j] <= epsilon).collect()
        };

        let mut labels = vec![Label::Unvisited; n];
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut processed = 0usize;

        for seed in 0..n {
            processed += 1;
            if processed % CLUSTERING_PROGRESS_INTERVAL == 0 {
                if let Some(report) = progress {
                    report(ProgressReport::new(ProgressStage::Clustering, processed, n));
                }
            }

            if labels[seed] != Label::Unvisited {
                continue;
            }

            let seed_neighbors = neighbors(seed);
            if seed_neighbors.len() < min_points {
                labels[seed] = Label::Noise;
                continue;
            }

            let cluster_id = clusters.len();
            labels[seed] = Label::Member(cluster_id);
            let mut members = vec![seed];

            let mut queue: VecDeque<usize> =
                seed_neighbors.into_iter().filter(|&q| q != seed).collect();

            while let Some(q) = queue.pop_front() {
                match labels[q] {
                    Label::Member(_) => {}
                    Label::Noise => {
                        // border point: density-reachable but not core
                        labels[q] = Label::Member(cluster_id);
                        members.push(q);
                    }
                    Label::Unvisited => {
                        labels[q] = Label::Member(cluster_id);
                        members.push(q);

                        let q_neighbors = neighbors(q);
                        if q_neighbors.len() >= min_points {
                            queue.extend(q_neighbors);
                        }
                    }
                }
            }

            members.sort_unstable();
            clusters.push(members);
        }

        if let Some(report) = progress {
            report(ProgressReport::new(ProgressStage::Clustering, n, n));
        }

        let noise = (0..n)
            .filter(|&i| labels[i] == Label::Noise)
            .map(|i| points[i].id.clone())
            .collect();

        RawClusters {
            clusters: clusters
                .into_iter()
                .map(|members| build_cluster(points, members))
                .collect(),
            noise,
            skipped: Vec::new(),
            iterations: n,
            embeddings: HashMap::new(),
        }
    }
}

fn build_cluster(points: &[Point], members: Vec<usize>) -> RawCluster {
    let embeddings: Vec<&[f32]> = members
        .iter()
        .map(|&i| points[i].embedding.as_slice())
        .collect();
    RawCluster {
        centroid: centroid(&embeddings),
        member_ids: members.into_iter().map(|i| points[i].id.clone()).collect(),
    }
}

/// Full pairwise cosine-similarity matrix. Rows are computed in parallel;
/// each row writes only its own slot, so the output is deterministic.
fn similarity_matrix(points: &[Point]) -> Vec<Vec<f32>> {
    (0..points.len())
        .into_par_iter()
        .map(|i| {
            (0..points.len())
                .map(|j| {
                    if i == j {
                        1.0
                    } else {
                        cosine_similarity(&points[i].embedding, &points[j].embedding)
                    }
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusteringConfig;
    use crate::embedding::testing::StubProvider;

    fn chunk_with(id: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: format!("text for {id}"),
            embedding: Some(embedding),
            ..Default::default()
        }
    }

    /// Two tight groups of three around orthogonal directions, within-group
    /// cosine similarity ~0.97+, cross-group ~0.0-0.4.
    fn two_group_chunks() -> Vec<Chunk> {
        vec![
            chunk_with("a1", vec![1.0, 0.02, 0.0]),
            chunk_with("a2", vec![0.98, 0.05, 0.0]),
            chunk_with("a3", vec![1.0, 0.0, 0.04]),
            chunk_with("b1", vec![0.0, 1.0, 0.03]),
            chunk_with("b2", vec![0.05, 0.99, 0.0]),
            chunk_with("b3", vec![0.0, 1.0, 0.05]),
        ]
    }

    fn engine_config(algorithm: Algorithm) -> ClusteringConfig {
        ClusteringConfig {
            algorithm,
            ..Default::default()
        }
    }

    #[test]
    fn test_hierarchical_two_groups() {
        let provider = StubProvider::new(3);
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        let result = engine.cluster(&two_group_chunks(), None);

        assert_eq!(result.clusters.len(), 2);
        assert!(result.noise.is_empty());
        assert!(result.skipped.is_empty());

        let mut sizes: Vec<usize> = result.clusters.iter().map(|c| c.member_ids.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![3, 3]);
    }

    #[test]
    fn test_hierarchical_centroid_is_member_mean() {
        let provider = StubProvider::new(3);
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        let chunks = two_group_chunks();
        let result = engine.cluster(&chunks, None);

        for cluster in &result.clusters {
            let members: Vec<&[f32]> = cluster
                .member_ids
                .iter()
                .map(|id| {
                    chunks
                        .iter()
                        .find(|c| &c.id == id)
                        .unwrap()
                        .embedding
                        .as_deref()
                        .unwrap()
                })
                .collect();
            let expected = centroid(&members);
            for (a, b) in cluster.centroid.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_hierarchical_is_deterministic() {
        let provider = StubProvider::new(3);
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        let first = engine.cluster(&two_group_chunks(), None);
        let second = engine.cluster(&two_group_chunks(), None);

        let members = |r: &RawClusters| -> Vec<Vec<String>> {
            r.clusters.iter().map(|c| c.member_ids.clone()).collect()
        };
        assert_eq!(members(&first), members(&second));
    }

    #[test]
    fn test_hierarchical_no_merges_below_threshold() {
        let provider = StubProvider::new(3);
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        // mutually dissimilar points stay singletons
        let chunks = vec![
            chunk_with("x", vec![1.0, 0.0, 0.0]),
            chunk_with("y", vec![0.0, 1.0, 0.0]),
            chunk_with("z", vec![0.0, 0.0, 1.0]),
        ];
        let result = engine.cluster(&chunks, None);
        assert_eq!(result.clusters.len(), 3);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_max_clusters_forces_merging_below_threshold() {
        let provider = StubProvider::new(3);
        let mut config = engine_config(Algorithm::Hierarchical);
        config.max_clusters = 1;
        let engine = ClusteringEngine::new(&provider, config).unwrap();

        let chunks = vec![
            chunk_with("x", vec![1.0, 0.0, 0.0]),
            chunk_with("y", vec![0.0, 1.0, 0.0]),
            chunk_with("z", vec![0.0, 0.0, 1.0]),
        ];
        let result = engine.cluster(&chunks, None);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].member_ids.len(), 3);
    }

    #[test]
    fn test_dbscan_two_groups_with_noise() {
        let provider = StubProvider::new(3);
        let engine = ClusteringEngine::new(&provider, engine_config(Algorithm::Dbscan)).unwrap();

        let mut chunks = two_group_chunks();
        // a far outlier no dense neighborhood will absorb
        chunks.push(chunk_with("outlier", vec![-1.0, -1.0, 5.0]));

        let result = engine.cluster(&chunks, None);
        assert_eq!(result.clusters.len(), 2);
        assert_eq!(result.noise, vec!["outlier".to_string()]);
    }

    #[test]
    fn test_dbscan_is_deterministic() {
        let provider = StubProvider::new(3);
        let engine = ClusteringEngine::new(&provider, engine_config(Algorithm::Dbscan)).unwrap();

        let first = engine.cluster(&two_group_chunks(), None);
        let second = engine.cluster(&two_group_chunks(), None);

        let members = |r: &RawClusters| -> Vec<Vec<String>> {
            r.clusters.iter().map(|c| c.member_ids.clone()).collect()
        };
        assert_eq!(members(&first), members(&second));
    }

    #[test]
    fn test_embedding_failure_excludes_chunk() {
        let provider = StubProvider::new(3).failing_on("text for broken");
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        let mut chunks = two_group_chunks();
        chunks.push(Chunk {
            id: "broken".to_string(),
            text: "text for broken".to_string(),
            embedding: None,
            ..Default::default()
        });

        let result = engine.cluster(&chunks, None);
        assert_eq!(result.skipped, vec!["broken".to_string()]);
        assert_eq!(result.clusters.len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_excludes_chunk() {
        let provider = StubProvider::new(3);
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        let mut chunks = two_group_chunks();
        chunks.push(chunk_with("wide", vec![1.0, 0.0, 0.0, 0.0]));

        let result = engine.cluster(&chunks, None);
        assert_eq!(result.skipped, vec!["wide".to_string()]);
    }

    #[test]
    fn test_empty_input() {
        let provider = StubProvider::new(3);
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        let result = engine.cluster(&[], None);
        assert!(result.clusters.is_empty());
        assert!(result.noise.is_empty());
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn test_progress_reports_emitted() {
        use std::cell::RefCell;

        let provider = StubProvider::new(3);
        let engine =
            ClusteringEngine::new(&provider, engine_config(Algorithm::Hierarchical)).unwrap();

        let chunks: Vec<Chunk> = (0..15)
            .map(|i| Chunk {
                id: format!("c{i}"),
                text: format!("chunk number {i}"),
                embedding: None,
                ..Default::default()
            })
            .collect();

        let reports = RefCell::new(Vec::new());
        let callback = |report: ProgressReport| reports.borrow_mut().push(report);
        engine.cluster(&chunks, Some(&callback));

        let reports = reports.into_inner();
        assert!(reports
            .iter()
            .any(|r| r.stage == ProgressStage::Embeddings && r.percentage == 100));
        assert!(reports
            .iter()
            .any(|r| r.stage == ProgressStage::Clustering && r.percentage == 100));
    }
}
