//! Semantic clustering pipeline for knowledge chunks.
//!
//! # Architecture
//!
//! - `similarity`: cosine similarity and centroid primitives
//! - `engine`: groups chunks into raw clusters (hierarchical or DBSCAN)
//! - `postprocess`: size filtering, coherence scoring, keyword extraction
//! - `retriever`: ranks post-processed clusters against a query

pub mod engine;
mod postprocess;
mod retriever;
pub mod similarity;

pub use engine::{Algorithm, ClusteringEngine, Linkage, RawCluster, RawClusters};
pub use postprocess::{post_process, Cluster, ClusterSet, ClusterStatistics};
pub use retriever::{ClusterMatch, ClusterRetriever, RetrievalError};
pub use similarity::{centroid, cosine_similarity};

/// Pipeline stage a progress report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Embeddings,
    Clustering,
}

/// Progress checkpoint emitted while embedding or clustering, so a host UI
/// is never blocked for the full duration of a build.
#[derive(Debug, Clone, Copy)]
pub struct ProgressReport {
    pub stage: ProgressStage,
    pub current: usize,
    pub total: usize,
    /// 0-100, saturating.
    pub percentage: u8,
}

impl ProgressReport {
    pub fn new(stage: ProgressStage, current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((current * 100) / total).min(100) as u8
        };
        Self {
            stage,
            current,
            total,
            percentage,
        }
    }
}

/// Callback invoked with progress checkpoints.
pub type ProgressFn<'a> = dyn Fn(ProgressReport) + 'a;
