//! Versioned snapshot record for persisted knowledge state.
//!
//! The wire form is plain camelCase JSON so any backend can hold it.
//! Loaders support the current schema version and one prior version:
//! version 1 predates glossary tracking and the exposure counter, and its
//! missing fields default on load. Records are upgraded in memory only;
//! history is not rewritten until the next save.

use serde::{Deserialize, Serialize};

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Oldest schema version loaders still accept.
pub const MIN_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("record is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("schema version {0} is newer than supported version {1}")]
    UnsupportedVersion(u32, u32),

    #[error("schema version {0} is older than oldest supported version {1}")]
    TooOld(u32, u32),
}

/// A persisted knowledge-state record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema_version: u32,

    /// Wall-clock save time, epoch milliseconds.
    pub saved_at: u64,

    #[serde(default)]
    pub learned_chunk_ids: Vec<String>,

    #[serde(default)]
    pub categories_seen: Vec<String>,

    #[serde(default)]
    pub tags_seen: Vec<String>,

    /// Added in schema version 2.
    #[serde(default)]
    pub glossary_terms_seen: Vec<String>,

    /// Added in schema version 2.
    #[serde(default)]
    pub exposure_count: u64,
}

impl Snapshot {
    /// Parse a record, accepting the current and one prior schema version.
    ///
    /// Older-version records come back upgraded in memory: missing fields
    /// hold their defaults and `schema_version` is bumped so the next save
    /// writes the current schema.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        let mut snapshot: Snapshot = serde_json::from_slice(data)?;

        if snapshot.schema_version > SCHEMA_VERSION {
            return Err(SnapshotError::UnsupportedVersion(
                snapshot.schema_version,
                SCHEMA_VERSION,
            ));
        }
        if snapshot.schema_version < MIN_SCHEMA_VERSION {
            return Err(SnapshotError::TooOld(
                snapshot.schema_version,
                MIN_SCHEMA_VERSION,
            ));
        }

        if snapshot.schema_version < SCHEMA_VERSION {
            log::info!(
                "upgrading snapshot from schema version {} to {}",
                snapshot.schema_version,
                SCHEMA_VERSION
            );
            snapshot.schema_version = SCHEMA_VERSION;
        }

        Ok(snapshot)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("snapshot serialization is infallible")
    }
}
