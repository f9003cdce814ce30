//! Query-time ranking of clusters against an embedded query.

use crate::embedding::{EmbeddingError, EmbeddingProvider};

use super::postprocess::ClusterSet;
use super::similarity::cosine_similarity;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// A cluster ranked against a query.
#[derive(Debug, Clone)]
pub struct ClusterMatch {
    /// Index into the [`ClusterSet`]'s cluster list.
    pub cluster_index: usize,
    pub similarity: f32,
}

/// Ranks clusters by centroid similarity to a query. Pure read: never
/// mutates stored state.
pub struct ClusterRetriever<'a> {
    provider: &'a dyn EmbeddingProvider,
}

impl<'a> ClusterRetriever<'a> {
    pub fn new(provider: &'a dyn EmbeddingProvider) -> Self {
        Self { provider }
    }

    /// Embed the query and return the `top_k` most similar clusters,
    /// sorted by non-increasing similarity. The sort is stable, so equal
    /// similarities keep ordinal cluster order.
    pub fn query(
        &self,
        text: &str,
        clusters: &ClusterSet,
        top_k: usize,
    ) -> Result<Vec<ClusterMatch>, RetrievalError> {
        let query_embedding = self.provider.embed(text)?;
        Ok(Self::rank(&query_embedding, clusters, top_k))
    }

    /// Rank clusters against an already-embedded query.
    pub fn rank(query_embedding: &[f32], clusters: &ClusterSet, top_k: usize) -> Vec<ClusterMatch> {
        let mut matches: Vec<ClusterMatch> = clusters
            .clusters
            .iter()
            .enumerate()
            .map(|(cluster_index, cluster)| ClusterMatch {
                cluster_index,
                similarity: cosine_similarity(query_embedding, &cluster.centroid),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        matches
    }
}
