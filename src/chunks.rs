//! Knowledge chunk records and catalog ingestion.
//!
//! A chunk is the unit of knowledge the clustering pipeline operates on:
//! a text fragment plus typed metadata and, optionally, a precomputed
//! embedding. Chunks are immutable once ingested; the whole catalog is
//! re-clustered when it changes.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Typed metadata attached to a chunk. Arbitrary extra fields are rejected
/// at ingestion instead of being carried as loose bags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub glossary_terms: Vec<String>,
}

/// A knowledge chunk: id, text, optional embedding, typed metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Chunk {
    pub id: String,
    pub text: String,

    /// Embedding vector. `None` means "embed me before clustering".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub glossary_terms: Vec<String>,
}

impl Chunk {
    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            category: self.category.clone(),
            tags: self.tags.clone(),
            glossary_terms: self.glossary_terms.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("chunk #{0} has an empty id")]
    EmptyId(usize),

    #[error("chunk '{0}' has no text")]
    EmptyText(String),

    #[error("duplicate chunk id '{0}'")]
    DuplicateId(String),

    #[error("chunk '{id}' embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        got: usize,
    },
}

/// Totals over the full chunk catalog, used as the denominator set for
/// knowledge-coverage computation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub chunk_ids: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub glossary_terms: BTreeSet<String>,
}

impl Catalog {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        let mut catalog = Catalog::default();
        for chunk in chunks {
            catalog.chunk_ids.insert(chunk.id.clone());
            if let Some(category) = &chunk.category {
                catalog.categories.insert(category.clone());
            }
            for tag in &chunk.tags {
                catalog.tags.insert(tag.clone());
            }
            for term in &chunk.glossary_terms {
                catalog.glossary_terms.insert(term.clone());
            }
        }
        catalog
    }

    pub fn total_chunks(&self) -> usize {
        self.chunk_ids.len()
    }
}

/// Parse and validate a chunk catalog from JSON bytes.
///
/// Validation: non-empty unique ids, non-empty text, and all present
/// embeddings of one common dimension.
pub fn parse_chunks(data: &[u8]) -> Result<Vec<Chunk>, ChunkError> {
    let chunks: Vec<Chunk> = serde_json::from_slice(data)?;
    validate_chunks(&chunks)?;
    Ok(chunks)
}

/// Load a chunk catalog from a JSON file.
pub fn load_chunks(path: &Path) -> Result<Vec<Chunk>, ChunkError> {
    let data = std::fs::read(path)?;
    parse_chunks(&data)
}

fn validate_chunks(chunks: &[Chunk]) -> Result<(), ChunkError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(chunks.len());
    let mut dimensions: Option<usize> = None;

    for (idx, chunk) in chunks.iter().enumerate() {
        if chunk.id.trim().is_empty() {
            return Err(ChunkError::EmptyId(idx));
        }
        if chunk.text.trim().is_empty() {
            return Err(ChunkError::EmptyText(chunk.id.clone()));
        }
        if !seen.insert(&chunk.id) {
            return Err(ChunkError::DuplicateId(chunk.id.clone()));
        }
        if let Some(embedding) = &chunk.embedding {
            match dimensions {
                None => dimensions = Some(embedding.len()),
                Some(expected) if embedding.len() != expected => {
                    return Err(ChunkError::DimensionMismatch {
                        id: chunk.id.clone(),
                        expected,
                        got: embedding.len(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_minimal_catalog() {
        let json = r#"[
            {"id": "a", "text": "alpha"},
            {"id": "b", "text": "beta", "tags": ["t1"], "glossaryTerms": ["g1"]}
        ]"#;

        let chunks = parse_chunks(json.as_bytes()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].tags, vec!["t1"]);
        assert_eq!(chunks[1].glossary_terms, vec!["g1"]);
        assert!(chunks[0].embedding.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let json = r#"[{"id": "a", "text": "alpha", "clickbait": true}]"#;
        assert!(matches!(
            parse_chunks(json.as_bytes()),
            Err(ChunkError::Malformed(_))
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let chunks = vec![chunk("a", "one"), chunk("a", "two")];
        let json = serde_json::to_vec(&chunks).unwrap();
        assert!(matches!(
            parse_chunks(&json),
            Err(ChunkError::DuplicateId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_empty_id_and_text_rejected() {
        let json = serde_json::to_vec(&vec![chunk("", "one")]).unwrap();
        assert!(matches!(parse_chunks(&json), Err(ChunkError::EmptyId(0))));

        let json = serde_json::to_vec(&vec![chunk("a", "  ")]).unwrap();
        assert!(matches!(parse_chunks(&json), Err(ChunkError::EmptyText(_))));
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        let mut a = chunk("a", "one");
        a.embedding = Some(vec![1.0, 0.0]);
        let mut b = chunk("b", "two");
        b.embedding = Some(vec![1.0, 0.0, 0.0]);

        let json = serde_json::to_vec(&vec![a, b]).unwrap();
        assert!(matches!(
            parse_chunks(&json),
            Err(ChunkError::DimensionMismatch { expected: 2, got: 3, .. })
        ));
    }

    #[test]
    fn test_catalog_totals() {
        let mut a = chunk("a", "one");
        a.category = Some("basics".into());
        a.tags = vec!["x".into(), "y".into()];
        let mut b = chunk("b", "two");
        b.category = Some("basics".into());
        b.tags = vec!["y".into()];
        b.glossary_terms = vec!["term".into()];

        let catalog = Catalog::from_chunks(&[a, b]);
        assert_eq!(catalog.total_chunks(), 2);
        assert_eq!(catalog.categories.len(), 1);
        assert_eq!(catalog.tags.len(), 2);
        assert_eq!(catalog.glossary_terms.len(), 1);
    }
}
