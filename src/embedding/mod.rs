//! Embedding generation behind a provider trait.
//!
//! The clustering pipeline never talks to a concrete model directly:
//! everything goes through [`EmbeddingProvider`], so the fastembed-backed
//! implementation can be swapped for a deterministic stub in tests and the
//! caching decorator can sit in between transparently.
//!
//! - `fastembed`: local ONNX model wrapper (lazy load, dimension probing)
//! - `cache`: binary on-disk cache keyed by content hash

pub mod cache;
mod fastembed;

pub use cache::{CacheError, CachingProvider, EmbeddingCache};
pub use fastembed::FastembedProvider;

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Produces fixed-length embedding vectors for text.
///
/// Implementations must be deterministic for identical text and model
/// version, and failures must be catchable per call.
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embedding dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// SHA-256 hash identifying the underlying model.
    fn model_id_hash(&self) -> [u8; 32];
}
