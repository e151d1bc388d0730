//! Persistent string-set files backing the seen/bought ledgers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A set of identity keys persisted as a sorted JSON array of strings.
///
/// Loading never fails: a missing, unreadable or corrupt file yields an
/// empty set. Saving rewrites the whole file; it is not atomic, which is
/// tolerated because a corrupted file degrades to empty on the next load.
#[derive(Debug)]
pub struct SetFile {
    path: PathBuf,
    items: BTreeSet<String>,
}

impl SetFile {
    /// Load the set at `path`, degrading to empty on any error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<BTreeSet<String>>(&data) {
                Ok(set) => set,
                Err(e) => {
                    tracing::debug!("Discarding unparseable set file {}: {}", path.display(), e);
                    BTreeSet::new()
                }
            },
            Err(_) => BTreeSet::new(),
        };
        Self { path, items }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains(key)
    }

    /// Insert a key into the in-memory set. Returns false if already present.
    pub fn insert(&mut self, key: &str) -> bool {
        self.items.insert(key.to_string())
    }

    /// Write the full set to disk as a sorted JSON array.
    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_string(&self.items).context("Failed to serialize set")?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
