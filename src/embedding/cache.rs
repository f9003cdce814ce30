//! Binary on-disk cache for generated embeddings.
//!
//! File format: embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, ordered by content hash):
//! - content_hash: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! A model change or a corrupted file yields a fresh empty cache, never an
//! error surfaced to the pipeline: re-embedding is always a valid recovery.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::{EmbeddingError, EmbeddingProvider};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Hash text content for cache keying. SHA-256-derived so keys are stable
/// across runs and toolchain versions.
pub fn content_hash(text: &str) -> u64 {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

/// Storage manager for the embedding cache file.
pub struct EmbeddingCache {
    path: PathBuf,
}

impl EmbeddingCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load cached entries, validating version, model and dimensions.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<BTreeMap<u64, Vec<f32>>, CacheError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION {
            return Err(CacheError::VersionMismatch(version, FORMAT_VERSION));
        }

        let computed_checksum = crc32fast::hash(&header_bytes[0..43]);
        let stored_checksum = u32::from_le_bytes(
            header_bytes[43..47]
                .try_into()
                .expect("fixed-size header slice"),
        );
        if stored_checksum != computed_checksum {
            return Err(CacheError::ChecksumMismatch);
        }

        if header_bytes[1..33] != expected_model_id[..] {
            return Err(CacheError::ModelMismatch);
        }

        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]) as usize;
        if dimensions != expected_dimensions {
            return Err(CacheError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let entry_count = u64::from_le_bytes(
            header_bytes[35..43]
                .try_into()
                .expect("fixed-size header slice"),
        );

        let mut entries = BTreeMap::new();
        for _ in 0..entry_count {
            let mut hash_bytes = [0u8; 8];
            reader.read_exact(&mut hash_bytes)?;
            let hash = u64::from_le_bytes(hash_bytes);

            let mut embedding = Vec::with_capacity(dimensions);
            let mut float_bytes = [0u8; 4];
            for _ in 0..dimensions {
                reader.read_exact(&mut float_bytes)?;
                embedding.push(f32::from_le_bytes(float_bytes));
            }
            entries.insert(hash, embedding);
        }

        Ok(entries)
    }

    /// Save entries atomically: temp file -> fsync -> rename.
    pub fn save(
        &self,
        entries: &BTreeMap<u64, Vec<f32>>,
        model_id: &[u8; 32],
        dimensions: usize,
    ) -> Result<(), CacheError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, entries, model_id, dimensions);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        entries: &BTreeMap<u64, Vec<f32>>,
        model_id: &[u8; 32],
        dimensions: usize,
    ) -> Result<(), CacheError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes[0] = FORMAT_VERSION;
        header_bytes[1..33].copy_from_slice(model_id);
        header_bytes[33..35].copy_from_slice(&(dimensions as u16).to_le_bytes());
        header_bytes[35..43].copy_from_slice(&(entries.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header_bytes)?;

        for (hash, embedding) in entries {
            writer.write_all(&hash.to_le_bytes())?;
            for &value in embedding {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        Ok(())
    }
}

/// Caching decorator around an [`EmbeddingProvider`].
///
/// Looks embeddings up by content hash before delegating to the inner
/// provider; newly generated embeddings are kept for the next `persist`.
pub struct CachingProvider<'a> {
    inner: &'a dyn EmbeddingProvider,
    entries: RwLock<BTreeMap<u64, Vec<f32>>>,
    dirty: AtomicBool,
}

impl<'a> CachingProvider<'a> {
    /// Wrap a provider with entries loaded from `cache`. An absent,
    /// model-mismatched or corrupted cache file starts empty.
    pub fn load_or_empty(inner: &'a dyn EmbeddingProvider, cache: &EmbeddingCache) -> Self {
        let entries = if cache.exists() {
            match cache.load(&inner.model_id_hash(), inner.dimensions()) {
                Ok(entries) => {
                    log::info!("loaded {} cached embeddings", entries.len());
                    entries
                }
                Err(CacheError::ModelMismatch) => {
                    log::warn!("embedding model changed, starting fresh cache");
                    BTreeMap::new()
                }
                Err(err) => {
                    log::warn!("embedding cache unusable ({err}), starting fresh");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Self {
            inner,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the cache back to disk if anything was added.
    pub fn persist(&self, cache: &EmbeddingCache) -> Result<(), CacheError> {
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(());
        }

        let entries = self
            .entries
            .read()
            .map_err(|_| std::io::Error::other("cache lock poisoned"))?;
        cache.save(&entries, &self.inner.model_id_hash(), self.inner.dimensions())?;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl EmbeddingProvider for CachingProvider<'_> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = content_hash(text);

        if let Ok(entries) = self.entries.read() {
            if let Some(embedding) = entries.get(&key) {
                return Ok(embedding.clone());
            }
        }

        let embedding = self.inner.embed(text)?;
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, embedding.clone());
            self.dirty.store(true, Ordering::Relaxed);
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_id_hash(&self) -> [u8; 32] {
        self.inner.model_id_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::StubProvider;
    use tempfile::TempDir;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    #[test]
    fn test_content_hash_stable_and_distinct() {
        assert_eq!(content_hash("alpha"), content_hash("alpha"));
        assert_ne!(content_hash("alpha"), content_hash("beta"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings.bin"));
        let model_id = test_model_id();

        let mut entries = BTreeMap::new();
        entries.insert(1u64, vec![1.0, 0.0, 0.5]);
        entries.insert(2u64, vec![0.0, 1.0, -0.5]);

        cache.save(&entries, &model_id, 3).unwrap();
        assert!(cache.exists());

        let loaded = cache.load(&model_id, 3).unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_model_mismatch() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings.bin"));

        cache.save(&BTreeMap::new(), &test_model_id(), 3).unwrap();

        let mut other_model = [0u8; 32];
        other_model[0] = 0xFF;
        assert!(matches!(
            cache.load(&other_model, 3),
            Err(CacheError::ModelMismatch)
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings.bin"));

        cache.save(&BTreeMap::new(), &test_model_id(), 3).unwrap();
        assert!(matches!(
            cache.load(&test_model_id(), 384),
            Err(CacheError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("embeddings.bin");
        let cache = EmbeddingCache::new(path.clone());

        let mut entries = BTreeMap::new();
        entries.insert(1u64, vec![1.0, 0.0, 0.0]);
        cache.save(&entries, &test_model_id(), 3).unwrap();

        // flip a byte inside the header
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            cache.load(&test_model_id(), 3),
            Err(CacheError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_caching_provider_reuses_entries() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings.bin"));
        let stub = StubProvider::new(3);

        {
            let caching = CachingProvider::load_or_empty(&stub, &cache);
            let first = caching.embed("hello world").unwrap();
            let second = caching.embed("hello world").unwrap();
            assert_eq!(first, second);
            assert_eq!(caching.len(), 1);
            caching.persist(&cache).unwrap();
        }

        // fresh decorator picks the entry back up from disk
        let caching = CachingProvider::load_or_empty(&stub, &cache);
        assert_eq!(caching.len(), 1);
    }

    #[test]
    fn test_caching_provider_passes_failures_through() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings.bin"));
        let stub = StubProvider::new(3).failing_on("bad");

        let caching = CachingProvider::load_or_empty(&stub, &cache);
        assert!(caching.embed("bad").is_err());
        assert_eq!(caching.len(), 0);
    }

    #[test]
    fn test_persist_skipped_when_clean() {
        let dir = TempDir::new().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("embeddings.bin"));
        let stub = StubProvider::new(3);

        let caching = CachingProvider::load_or_empty(&stub, &cache);
        caching.persist(&cache).unwrap();
        // nothing was embedded, so nothing was written
        assert!(!cache.exists());
    }
}
