//! High-level knowledge service.
//!
//! The single owning object behind every operation: it wires the embedding
//! provider, clustering engine, tiered persistence store and progress
//! tracker together, and serializes all mutation of knowledge state.
//! The embedding model is lazy-loaded on first use.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::chunks::{parse_chunks, Catalog, Chunk, ChunkError};
use crate::cluster::{
    post_process, Cluster, ClusterRetriever, ClusterSet, ClusterStatistics, ClusteringEngine,
    ProgressFn, RetrievalError,
};
use crate::config::{Config, ConfigError};
use crate::embedding::{
    CacheError, CachingProvider, EmbeddingCache, EmbeddingError, EmbeddingProvider,
    FastembedProvider,
};
use crate::knowledge::{KnowledgeGaps, KnowledgeState, KnowledgeTracker};
use crate::store::{FileBackend, Storage, TieredStore};

/// Key for the persisted chunk catalog in the data directory.
const CHUNKS_KEY: &str = "chunks.json";
/// Key for the persisted cluster set in the data directory.
const CLUSTERS_KEY: &str = "clusters.json";
/// Embedding cache file name.
const CACHE_FILE: &str = "embeddings.bin";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("chunk catalog error: {0}")]
    Chunks(#[from] ChunkError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored cluster data is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no cluster data found, run a build first")]
    NotBuilt,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io(io) => ServiceError::Io(io),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// A cluster ranked against a query, as returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHit {
    pub similarity: f32,
    #[serde(flatten)]
    pub cluster: Cluster,
}

/// Knowledge-progress summary for callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub coverage_percentage: f32,
    pub exposure_count: u64,
    pub learned_chunks: usize,
    pub total_chunks: usize,
    /// Epoch milliseconds of the last recorded exposure, 0 if none.
    pub last_updated: u64,
    pub gaps: KnowledgeGaps,
}

/// The owned service object coordinating the whole pipeline.
pub struct KnowledgeService {
    config: Config,
    base_path: PathBuf,
    files: FileBackend,
    store: TieredStore,
    tracker: Mutex<KnowledgeTracker>,
    /// Lazily-initialized embedding provider. Uses Mutex<Option<_>>
    /// so tests can inject a stub and production loads fastembed on
    /// first use.
    provider: Mutex<Option<Box<dyn EmbeddingProvider>>>,
}

impl KnowledgeService {
    /// Create a service with the lazy fastembed provider.
    pub fn new(config: Config, base_path: PathBuf) -> Result<Self, ServiceError> {
        Self::build_service(config, base_path, None)
    }

    /// Create a service with an injected embedding provider.
    pub fn with_provider(
        config: Config,
        base_path: PathBuf,
        provider: Box<dyn EmbeddingProvider>,
    ) -> Result<Self, ServiceError> {
        Self::build_service(config, base_path, Some(provider))
    }

    fn build_service(
        config: Config,
        base_path: PathBuf,
        provider: Option<Box<dyn EmbeddingProvider>>,
    ) -> Result<Self, ServiceError> {
        let files = FileBackend::new("data", base_path.clone())?;
        let store = TieredStore::open(&base_path)?;

        let state = store
            .load()
            .map(|snapshot| KnowledgeState::from_snapshot(&snapshot))
            .unwrap_or_default();

        let catalog = match files.exists(CHUNKS_KEY) {
            true => Catalog::from_chunks(&parse_chunks(&files.read(CHUNKS_KEY)?)?),
            false => Catalog::default(),
        };

        Ok(Self {
            config,
            base_path,
            files,
            store,
            tracker: Mutex::new(KnowledgeTracker::new(catalog, state)),
            provider: Mutex::new(provider),
        })
    }

    /// Run `f` with the embedding provider, initializing fastembed first
    /// if no provider exists yet.
    fn with_embedder<R>(
        &self,
        f: impl FnOnce(&dyn EmbeddingProvider) -> Result<R, ServiceError>,
    ) -> Result<R, ServiceError> {
        let mut guard = self
            .provider
            .lock()
            .map_err(|e| ServiceError::Internal(format!("Lock poisoned: {}", e)))?;

        if guard.is_none() {
            log::info!(
                "initializing embedding model '{}'",
                self.config.embedding.model
            );
            let timeout = Duration::from_secs(self.config.embedding.download_timeout_secs);
            let provider = FastembedProvider::new(
                &self.config.embedding.model,
                self.base_path.clone(),
                Some(timeout),
            )?;
            *guard = Some(Box::new(provider));
        }

        let provider = guard.as_ref().expect("provider initialized above");
        f(provider.as_ref())
    }

    /// Cluster a chunk catalog and persist the derived cluster data.
    ///
    /// Replaces any previous build wholesale; there is no incremental
    /// re-clustering. Returns the post-processing statistics.
    pub fn build(
        &self,
        chunks: Vec<Chunk>,
        progress: Option<&ProgressFn>,
    ) -> Result<ClusterStatistics, ServiceError> {
        let cache = EmbeddingCache::new(self.base_path.join(CACHE_FILE));

        let cluster_set = self.with_embedder(|provider| {
            let caching = CachingProvider::load_or_empty(provider, &cache);
            let engine = ClusteringEngine::new(&caching, self.config.clustering.clone())?;
            let raw = engine.cluster(&chunks, progress);
            let set = post_process(&raw, &chunks, &self.config.clustering);
            caching.persist(&cache)?;
            Ok(set)
        })?;

        self.files
            .write(CHUNKS_KEY, &serde_json::to_vec_pretty(&chunks)?)?;
        self.files
            .write(CLUSTERS_KEY, &serde_json::to_vec_pretty(&cluster_set)?)?;

        let catalog = Catalog::from_chunks(&chunks);
        self.tracker
            .lock()
            .map_err(|e| ServiceError::Internal(format!("Lock poisoned: {}", e)))?
            .replace_catalog(catalog);

        log::info!(
            "build complete: {} clusters over {} chunks ({} unclustered)",
            cluster_set.statistics.cluster_count,
            cluster_set.statistics.total_chunks,
            cluster_set.statistics.unclustered_count
        );

        Ok(cluster_set.statistics)
    }

    /// Rank clusters against a query.
    ///
    /// With `record` set, the members of the returned clusters count as
    /// exposed and the updated knowledge state is persisted immediately.
    pub fn query(
        &self,
        text: &str,
        top_k: Option<usize>,
        record: bool,
    ) -> Result<Vec<QueryHit>, ServiceError> {
        let cluster_set = self.load_clusters()?;
        let top_k = top_k.unwrap_or(self.config.retrieval.top_k);

        let matches = self.with_embedder(|provider| {
            let cache = EmbeddingCache::new(self.base_path.join(CACHE_FILE));
            let caching = CachingProvider::load_or_empty(provider, &cache);
            let retriever = ClusterRetriever::new(&caching);
            Ok(retriever.query(text, &cluster_set, top_k)?)
        })?;

        let hits: Vec<QueryHit> = matches
            .into_iter()
            .map(|m| QueryHit {
                similarity: m.similarity,
                cluster: cluster_set.clusters[m.cluster_index].clone(),
            })
            .collect();

        if record && !hits.is_empty() {
            self.record_hits(&hits)?;
        }

        Ok(hits)
    }

    /// Record exposure for all chunks of the given hits and persist.
    fn record_hits(&self, hits: &[QueryHit]) -> Result<(), ServiceError> {
        let chunks = self.load_chunks()?;

        let exposed_ids: Vec<String> = hits
            .iter()
            .flat_map(|hit| hit.cluster.member_chunk_ids.iter().cloned())
            .collect();

        let mut categories = Vec::new();
        let mut tags = Vec::new();
        let mut glossary_terms = Vec::new();
        for chunk in chunks.iter().filter(|c| exposed_ids.contains(&c.id)) {
            let metadata = chunk.metadata();
            if let Some(category) = metadata.category {
                categories.push(category);
            }
            tags.extend(metadata.tags);
            glossary_terms.extend(metadata.glossary_terms);
        }

        {
            let mut tracker = self
                .tracker
                .lock()
                .map_err(|e| ServiceError::Internal(format!("Lock poisoned: {}", e)))?;
            tracker.record_exposure(&exposed_ids, &categories, &tags, &glossary_terms);
        }

        self.flush();
        Ok(())
    }

    /// Current coverage and gaps.
    pub fn progress(&self) -> Result<ProgressSummary, ServiceError> {
        let tracker = self
            .tracker
            .lock()
            .map_err(|e| ServiceError::Internal(format!("Lock poisoned: {}", e)))?;

        Ok(ProgressSummary {
            coverage_percentage: tracker.coverage_percentage(),
            exposure_count: tracker.state().exposure_count,
            learned_chunks: tracker.state().learned_chunk_ids.len(),
            total_chunks: tracker.catalog().total_chunks(),
            last_updated: tracker.state().last_updated,
            gaps: tracker.gaps(),
        })
    }

    /// Persist dirty knowledge state. Returns true if a save happened and
    /// any storage tier accepted it. Safe to call from signal handlers and
    /// the autosave thread.
    pub fn flush(&self) -> bool {
        let Ok(mut tracker) = self.tracker.lock() else {
            log::error!("tracker lock poisoned, skipping state flush");
            return false;
        };

        if !tracker.is_dirty() {
            return false;
        }

        let accepted = self.store.save(&tracker.state().to_snapshot());
        if accepted {
            tracker.mark_clean();
        }
        accepted
    }

    /// Destroy all persisted knowledge state across every tier and all
    /// dated backups. Cluster data and the chunk catalog stay.
    pub fn reset(&self) -> Result<(), ServiceError> {
        self.store.reset();
        self.tracker
            .lock()
            .map_err(|e| ServiceError::Internal(format!("Lock poisoned: {}", e)))?
            .clear();
        log::info!("knowledge state reset");
        Ok(())
    }

    /// Load the persisted cluster set.
    pub fn load_clusters(&self) -> Result<ClusterSet, ServiceError> {
        if !self.files.exists(CLUSTERS_KEY) {
            return Err(ServiceError::NotBuilt);
        }
        Ok(serde_json::from_slice(&self.files.read(CLUSTERS_KEY)?)?)
    }

    /// Load the persisted chunk catalog.
    pub fn load_chunks(&self) -> Result<Vec<Chunk>, ServiceError> {
        if !self.files.exists(CHUNKS_KEY) {
            return Err(ServiceError::NotBuilt);
        }
        Ok(parse_chunks(&self.files.read(CHUNKS_KEY)?)?)
    }
}

/// Periodically flush dirty knowledge state from a background thread.
/// The thread is detached; it dies with the process.
pub fn spawn_autosave(service: Arc<KnowledgeService>) {
    let interval = Duration::from_secs(service.config.autosave_interval_secs);
    let spawned = std::thread::Builder::new()
        .name("kb-autosave".to_string())
        .spawn(move || loop {
            std::thread::sleep(interval);
            if service.flush() {
                log::debug!("autosaved knowledge state");
            }
        });

    if let Err(err) = spawned {
        log::warn!("could not start autosave thread: {err}");
    }
}
