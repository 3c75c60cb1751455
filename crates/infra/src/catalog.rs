//! Database catalog read from a directory of `*.params` files.
//!
//! Each file describes one installed reference database:
//!
//! ```json
//! { "name": "UniRef30", "path": "uniref", "version": "2023_02", "default": true, "order": 1 }
//! ```
//!
//! The catalog id is `path`. Entries sort by `order`, then id.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use msaq_core::DatabaseCatalog;

/// Extension of database descriptor files.
pub const PARAMS_EXTENSION: &str = "params";

/// One installed database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read database directory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Catalog loaded from the configured databases directory.
#[derive(Debug, Clone, Default)]
pub struct DirectoryCatalog {
    dir: PathBuf,
    entries: Vec<DatabaseEntry>,
}

impl DirectoryCatalog {
    /// Load every `*.params` file in `dir`. Malformed files are skipped.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let dir = dir.into();
        let read_err = |source| CatalogError::Read {
            path: dir.clone(),
            source,
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARAMS_EXTENSION) {
                continue;
            }

            match read_entry(&path) {
                Ok(entry) if entry.path.trim().is_empty() => {
                    warn!(file = %path.display(), "database descriptor has an empty path, skipping");
                }
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    warn!(file = %path.display(), %error, "unreadable database descriptor, skipping");
                }
            }
        }

        entries.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.path.cmp(&b.path)));
        entries.dedup_by(|a, b| a.path == b.path);
        debug!(dir = %dir.display(), databases = entries.len(), "database catalog loaded");

        Ok(Self { dir, entries })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[DatabaseEntry] {
        &self.entries
    }
}

fn read_entry(path: &Path) -> Result<DatabaseEntry, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

impl DatabaseCatalog for DirectoryCatalog {
    fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.path == id)
    }

    fn defaults(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.default)
            .map(|e| e.path.clone())
            .collect()
    }
}
