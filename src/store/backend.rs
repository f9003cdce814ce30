//! Storage backends behind one uniform interface.
//!
//! The tiered store iterates an ordered list of [`Storage`] implementations
//! instead of hand-writing per-call-site fallback chains.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::eid::Eid;

/// A key-value storage backend. Keys are flat identifiers (file names in
/// the durable backends).
pub trait Storage: Send + Sync {
    /// Human-readable tier name, for logs.
    fn name(&self) -> &str;
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
    fn list(&self) -> Vec<String>;
}

/// Durable backend: one file per key under a base directory.
/// Writes are atomic (unique temp file, then rename).
pub struct FileBackend {
    name: String,
    base_dir: PathBuf,
}

impl FileBackend {
    pub fn new(name: &str, base_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        Ok(FileBackend {
            name: name.to_string(),
            base_dir,
        })
    }
}

impl Storage for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.base_dir.join(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.base_dir.join(ident))
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.base_dir.join(ident);
        let temp_path = self.base_dir.join(format!("{}-{ident}", Eid::new()));

        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.base_dir.join(ident))
    }

    fn list(&self) -> Vec<String> {
        std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        let path = entry.path();
                        if path.is_file() {
                            path.file_name()
                                .and_then(|name| name.to_str())
                                .map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Volatile session-scoped backend: keys live in memory and die with the
/// process. Last resort of the tier chain, and the storage double in tests.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryBackend {
    fn name(&self) -> &str {
        "session"
    }

    fn exists(&self, ident: &str) -> bool {
        self.entries
            .read()
            .map(|e| e.contains_key(ident))
            .unwrap_or(false)
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        self.entries
            .read()
            .map_err(|_| std::io::Error::other("lock poisoned"))?
            .get(ident)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        self.entries
            .write()
            .map_err(|_| std::io::Error::other("lock poisoned"))?
            .insert(ident.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        self.entries
            .write()
            .map_err(|_| std::io::Error::other("lock poisoned"))?
            .remove(ident)
            .map(|_| ())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
    }

    fn list(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }
}
