//! Tiered, fallback-chained persistence for knowledge state.
//!
//! # Architecture
//!
//! - `backend`: the `Storage` trait plus file and in-memory backends
//! - `snapshot`: the versioned record written through the tiers
//!
//! Writes go to every tier (redundancy); a save succeeds if any tier
//! accepted it. Reads walk the tiers in order and treat unreadable or
//! unparsable records as absent, finally falling back to the newest dated
//! backup. Each successful primary write also writes one dated backup per
//! calendar day, pruned to the 7 most recent.

pub mod backend;
pub mod snapshot;

use std::path::Path;

pub use backend::{FileBackend, MemoryBackend, Storage};
pub use snapshot::{Snapshot, SnapshotError, SCHEMA_VERSION};

/// Key the state record is stored under in every tier.
const STATE_KEY: &str = "knowledge.json";

/// Dated backups are named `knowledge-YYYY-MM-DD.json`.
const BACKUP_PREFIX: &str = "knowledge-";
const BACKUP_SUFFIX: &str = ".json";

/// Dated backups retained after rotation.
const MAX_BACKUPS: usize = 7;

/// Ordered chain of storage tiers with decreasing durability, plus a
/// dated-backup area fed from successful primary writes.
pub struct TieredStore {
    tiers: Vec<Box<dyn Storage>>,
    backups: Box<dyn Storage>,
}

impl TieredStore {
    pub fn new(tiers: Vec<Box<dyn Storage>>, backups: Box<dyn Storage>) -> Self {
        debug_assert!(!tiers.is_empty());
        Self { tiers, backups }
    }

    /// Open the standard three-tier chain under a data directory:
    /// `state/` (primary), `state-mirror/` (secondary), and a volatile
    /// in-memory tier, with dated backups under `state-backups/`.
    pub fn open(base: &Path) -> std::io::Result<Self> {
        Ok(Self::new(
            vec![
                Box::new(FileBackend::new("primary", base.join("state"))?),
                Box::new(FileBackend::new("mirror", base.join("state-mirror"))?),
                Box::new(MemoryBackend::new()),
            ],
            Box::new(FileBackend::new("backups", base.join("state-backups"))?),
        ))
    }

    /// Write the snapshot through every tier. Returns true if any tier
    /// accepted it; per-tier failures are logged and swallowed.
    pub fn save(&self, snapshot: &Snapshot) -> bool {
        let data = snapshot.to_bytes();
        let mut accepted = false;

        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.write(STATE_KEY, &data) {
                Ok(()) => {
                    accepted = true;
                    if index == 0 {
                        self.write_dated_backup(&data);
                    }
                }
                Err(err) => {
                    log::warn!("tier '{}' rejected state write: {err}", tier.name());
                }
            }
        }

        if !accepted {
            log::error!("all {} storage tiers rejected the state write", self.tiers.len());
        }
        accepted
    }

    /// Load the newest parsable state record: tiers in order, then the
    /// most recent surviving dated backup. Corrupted records are treated
    /// as absent.
    pub fn load(&self) -> Option<Snapshot> {
        for tier in &self.tiers {
            if !tier.exists(STATE_KEY) {
                continue;
            }
            match tier.read(STATE_KEY) {
                Ok(data) => match Snapshot::from_bytes(&data) {
                    Ok(snapshot) => {
                        log::debug!("loaded state from tier '{}'", tier.name());
                        return Some(snapshot);
                    }
                    Err(err) => {
                        log::warn!("tier '{}' holds an unusable record: {err}", tier.name());
                    }
                },
                Err(err) => {
                    log::warn!("tier '{}' read failed: {err}", tier.name());
                }
            }
        }

        for key in self.backup_keys_newest_first() {
            match self.backups.read(&key) {
                Ok(data) => match Snapshot::from_bytes(&data) {
                    Ok(snapshot) => {
                        log::warn!("all tiers failed, recovered state from backup '{key}'");
                        return Some(snapshot);
                    }
                    Err(err) => log::warn!("backup '{key}' is unusable: {err}"),
                },
                Err(err) => log::warn!("backup '{key}' read failed: {err}"),
            }
        }

        None
    }

    /// Remove the state record from every tier and delete all dated
    /// backups. Without the latter, a reset state would resurrect through
    /// the backup fallback on the next load.
    pub fn reset(&self) {
        for tier in &self.tiers {
            if tier.exists(STATE_KEY) {
                if let Err(err) = tier.delete(STATE_KEY) {
                    log::warn!("tier '{}' failed to delete state: {err}", tier.name());
                }
            }
        }
        for key in self.backup_keys_newest_first() {
            if let Err(err) = self.backups.delete(&key) {
                log::warn!("failed to delete backup '{key}': {err}");
            }
        }
    }

    /// Write today's dated backup (overwriting a same-day record) and
    /// prune old ones. Best-effort: failures are logged, never surfaced.
    fn write_dated_backup(&self, data: &[u8]) {
        let key = format!(
            "{BACKUP_PREFIX}{}{BACKUP_SUFFIX}",
            chrono::Local::now().format("%Y-%m-%d")
        );
        if let Err(err) = self.backups.write(&key, data) {
            log::warn!("dated backup write failed: {err}");
            return;
        }

        for stale in self.backup_keys_newest_first().into_iter().skip(MAX_BACKUPS) {
            match self.backups.delete(&stale) {
                Ok(()) => log::debug!("rotated out backup '{stale}'"),
                Err(err) => log::warn!("failed to rotate backup '{stale}': {err}"),
            }
        }
    }

    /// Dated backup keys, newest first. ISO dates sort lexicographically.
    fn backup_keys_newest_first(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .backups
            .list()
            .into_iter()
            .filter(|k| k.starts_with(BACKUP_PREFIX) && k.ends_with(BACKUP_SUFFIX))
            .collect();
        keys.sort_by(|a, b| b.cmp(a));
        keys
    }
}
