//! Knowledge-state tracking and coverage metrics.
//!
//! Consumes persisted state to answer "how much of the catalog has this
//! user been exposed to, and what is left". The in-memory state uses
//! ordered sets so serialization is deterministic.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunks::Catalog;
use crate::store::{Snapshot, SCHEMA_VERSION};

/// Coverage weights per dimension. They sum to 1.0.
const CHUNK_WEIGHT: f32 = 0.5;
const CATEGORY_WEIGHT: f32 = 0.2;
const TAG_WEIGHT: f32 = 0.2;
const GLOSSARY_WEIGHT: f32 = 0.1;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// What a user has been exposed to so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeState {
    pub learned_chunk_ids: BTreeSet<String>,
    pub categories_seen: BTreeSet<String>,
    pub tags_seen: BTreeSet<String>,
    pub glossary_terms_seen: BTreeSet<String>,
    pub exposure_count: u64,
    pub last_updated: u64,
}

impl KnowledgeState {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            learned_chunk_ids: snapshot.learned_chunk_ids.iter().cloned().collect(),
            categories_seen: snapshot.categories_seen.iter().cloned().collect(),
            tags_seen: snapshot.tags_seen.iter().cloned().collect(),
            glossary_terms_seen: snapshot.glossary_terms_seen.iter().cloned().collect(),
            exposure_count: snapshot.exposure_count,
            last_updated: snapshot.saved_at,
        }
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            schema_version: SCHEMA_VERSION,
            saved_at: now_ms(),
            learned_chunk_ids: self.learned_chunk_ids.iter().cloned().collect(),
            categories_seen: self.categories_seen.iter().cloned().collect(),
            tags_seen: self.tags_seen.iter().cloned().collect(),
            glossary_terms_seen: self.glossary_terms_seen.iter().cloned().collect(),
            exposure_count: self.exposure_count,
        }
    }
}

/// Per-dimension difference between the catalog and what has been seen.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeGaps {
    pub chunks: Vec<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub glossary_terms: Vec<String>,
}

/// Tracks exposure against a fixed catalog and computes weighted coverage.
pub struct KnowledgeTracker {
    catalog: Catalog,
    state: KnowledgeState,
    dirty: bool,
}

impl KnowledgeTracker {
    pub fn new(catalog: Catalog, state: KnowledgeState) -> Self {
        Self {
            catalog,
            state,
            dirty: false,
        }
    }

    pub fn state(&self) -> &KnowledgeState {
        &self.state
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Swap in a new catalog after a rebuild. Exposure state is kept.
    pub fn replace_catalog(&mut self, catalog: Catalog) {
        self.catalog = catalog;
    }

    /// Drop all exposure state, e.g. on explicit reset.
    pub fn clear(&mut self) {
        self.state = KnowledgeState::default();
        self.dirty = false;
    }

    /// True when the in-memory state has mutations not yet persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Record that the user was exposed to these chunks and their
    /// metadata. Marks the state dirty.
    pub fn record_exposure(
        &mut self,
        chunk_ids: &[String],
        categories: &[String],
        tags: &[String],
        glossary_terms: &[String],
    ) {
        self.state
            .learned_chunk_ids
            .extend(chunk_ids.iter().cloned());
        self.state.categories_seen.extend(categories.iter().cloned());
        self.state.tags_seen.extend(tags.iter().cloned());
        self.state
            .glossary_terms_seen
            .extend(glossary_terms.iter().cloned());
        self.state.exposure_count += 1;
        self.state.last_updated = now_ms();
        self.dirty = true;
    }

    /// Weighted coverage over the catalog, in percent [0, 100].
    ///
    /// 0.5·chunks + 0.2·categories + 0.2·tags + 0.1·glossary, each ratio
    /// capped at 1.0 before weighting. An empty catalog dimension is
    /// vacuously covered.
    pub fn coverage_percentage(&self) -> f32 {
        let score = CHUNK_WEIGHT
            * ratio(self.state.learned_chunk_ids.len(), self.catalog.chunk_ids.len())
            + CATEGORY_WEIGHT
                * ratio(self.state.categories_seen.len(), self.catalog.categories.len())
            + TAG_WEIGHT * ratio(self.state.tags_seen.len(), self.catalog.tags.len())
            + GLOSSARY_WEIGHT
                * ratio(
                    self.state.glossary_terms_seen.len(),
                    self.catalog.glossary_terms.len(),
                );

        (score * 100.0).min(100.0)
    }

    /// What remains unseen, per dimension, sorted.
    pub fn gaps(&self) -> KnowledgeGaps {
        KnowledgeGaps {
            chunks: difference(&self.catalog.chunk_ids, &self.state.learned_chunk_ids),
            categories: difference(&self.catalog.categories, &self.state.categories_seen),
            tags: difference(&self.catalog.tags, &self.state.tags_seen),
            glossary_terms: difference(
                &self.catalog.glossary_terms,
                &self.state.glossary_terms_seen,
            ),
        }
    }
}

fn ratio(seen: usize, total: usize) -> f32 {
    if total == 0 {
        return 1.0;
    }
    (seen as f32 / total as f32).min(1.0)
}

fn difference(catalog: &BTreeSet<String>, seen: &BTreeSet<String>) -> Vec<String> {
    catalog.difference(seen).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::Chunk;

    /// Catalog with the given counts of chunks, categories, tags and
    /// glossary terms spread over the chunks.
    fn catalog(chunks: usize, categories: usize, tags: usize, glossary: usize) -> Catalog {
        let mut all = Vec::new();
        for i in 0..chunks {
            let mut chunk = Chunk {
                id: format!("chunk-{i:02}"),
                text: format!("text {i}"),
                ..Default::default()
            };
            if categories > 0 {
                chunk.category = Some(format!("cat-{:02}", i % categories));
            }
            chunk.tags = (0..tags)
                .filter(|t| t % chunks == i)
                .map(|t| format!("tag-{t:02}"))
                .collect();
            chunk.glossary_terms = (0..glossary)
                .filter(|g| g % chunks == i)
                .map(|g| format!("term-{g:02}"))
                .collect();
            all.push(chunk);
        }
        Catalog::from_chunks(&all)
    }

    #[test]
    fn test_weighted_coverage_formula() {
        // 10/20 chunks, 2/8 categories, 5/40 tags, 3/50 glossary terms
        // => 0.5*0.5 + 0.2*0.25 + 0.2*0.125 + 0.1*0.06 = 33.1%
        let catalog = catalog(20, 8, 40, 50);
        let mut tracker = KnowledgeTracker::new(catalog, KnowledgeState::default());

        let chunks: Vec<String> = (0..10).map(|i| format!("chunk-{i:02}")).collect();
        let categories: Vec<String> = (0..2).map(|i| format!("cat-{i:02}")).collect();
        let tags: Vec<String> = (0..5).map(|i| format!("tag-{i:02}")).collect();
        let glossary: Vec<String> = (0..3).map(|i| format!("term-{i:02}")).collect();
        tracker.record_exposure(&chunks, &categories, &tags, &glossary);

        assert!((tracker.coverage_percentage() - 33.1).abs() < 0.05);
    }

    #[test]
    fn test_full_exposure_is_one_hundred_percent() {
        let cat = catalog(4, 2, 3, 2);
        let mut tracker = KnowledgeTracker::new(cat.clone(), KnowledgeState::default());

        tracker.record_exposure(
            &cat.chunk_ids.iter().cloned().collect::<Vec<_>>(),
            &cat.categories.iter().cloned().collect::<Vec<_>>(),
            &cat.tags.iter().cloned().collect::<Vec<_>>(),
            &cat.glossary_terms.iter().cloned().collect::<Vec<_>>(),
        );

        assert!((tracker.coverage_percentage() - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_ratios_capped_at_one() {
        let cat = catalog(2, 1, 1, 1);
        let mut tracker = KnowledgeTracker::new(cat, KnowledgeState::default());

        // expose more than the catalog holds
        let extra: Vec<String> = (0..10).map(|i| format!("phantom-{i}")).collect();
        tracker.record_exposure(&extra, &extra, &extra, &extra);

        // chunk ratio capped: 10 phantoms over 2 catalog chunks is still 1.0
        let score = tracker.coverage_percentage();
        assert!(score <= 100.0);
        assert!((score - (50.0 + 20.0 + 20.0 + 10.0)).abs() < 1e-4);
    }

    #[test]
    fn test_empty_dimension_is_vacuously_covered() {
        // no glossary terms anywhere in the catalog
        let cat = catalog(2, 1, 1, 0);
        let tracker = KnowledgeTracker::new(cat, KnowledgeState::default());

        // glossary contributes its full 10 points despite nothing seen
        assert!((tracker.coverage_percentage() - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_gaps_are_set_differences() {
        let cat = catalog(3, 2, 2, 1);
        let mut tracker = KnowledgeTracker::new(cat, KnowledgeState::default());

        tracker.record_exposure(
            &["chunk-00".to_string()],
            &["cat-00".to_string()],
            &[],
            &[],
        );

        let gaps = tracker.gaps();
        assert_eq!(gaps.chunks, vec!["chunk-01", "chunk-02"]);
        assert_eq!(gaps.categories, vec!["cat-01"]);
        assert_eq!(gaps.tags, vec!["tag-00", "tag-01"]);
        assert_eq!(gaps.glossary_terms, vec!["term-00"]);
    }

    #[test]
    fn test_exposure_marks_dirty_and_counts() {
        let mut tracker = KnowledgeTracker::new(catalog(2, 0, 0, 0), KnowledgeState::default());
        assert!(!tracker.is_dirty());

        tracker.record_exposure(&["chunk-00".to_string()], &[], &[], &[]);
        assert!(tracker.is_dirty());
        assert_eq!(tracker.state().exposure_count, 1);

        tracker.record_exposure(&["chunk-01".to_string()], &[], &[], &[]);
        assert_eq!(tracker.state().exposure_count, 2);

        tracker.mark_clean();
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_repeated_exposure_is_idempotent_on_sets() {
        let mut tracker = KnowledgeTracker::new(catalog(2, 0, 0, 0), KnowledgeState::default());

        tracker.record_exposure(&["chunk-00".to_string()], &[], &[], &[]);
        tracker.record_exposure(&["chunk-00".to_string()], &[], &[], &[]);

        assert_eq!(tracker.state().learned_chunk_ids.len(), 1);
        assert_eq!(tracker.state().exposure_count, 2);
    }

    #[test]
    fn test_state_snapshot_roundtrip() {
        let mut state = KnowledgeState::default();
        state.learned_chunk_ids.insert("a".into());
        state.categories_seen.insert("c".into());
        state.exposure_count = 5;

        let snapshot = state.to_snapshot();
        let restored = KnowledgeState::from_snapshot(&snapshot);

        assert_eq!(restored.learned_chunk_ids, state.learned_chunk_ids);
        assert_eq!(restored.categories_seen, state.categories_seen);
        assert_eq!(restored.exposure_count, state.exposure_count);
    }
}
