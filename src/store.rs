//! Persistent hash store — `(task_id, artifact_key) → digest`.
//!
//! Backed by a single YAML document `.hashes.yaml` under the hidden build
//! directory, mapping task ids to `{artifact_key: digest}` tables. The
//! store is owned by the coordinator for the build's lifetime; workers
//! never touch it. Mutations stay in memory until `flush`, which is called
//! after every task completion and once at shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const STORE_FILENAME: &str = ".hashes.yaml";

#[derive(Debug)]
pub struct HashStore {
    path: PathBuf,
    entries: BTreeMap<String, BTreeMap<String, String>>,
    dirty: bool,
}

impl HashStore {
    /// Load the store from the hidden build directory, or start empty when
    /// no file exists yet.
    pub fn load(hidden_build_directory: &Path) -> Result<Self> {
        let path = hidden_build_directory.join(STORE_FILENAME);
        let entries = if path.is_file() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_yaml::from_str::<Option<BTreeMap<String, BTreeMap<String, String>>>>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn get(&self, task_id: &str, key: &str) -> Option<&str> {
        self.entries
            .get(task_id)
            .and_then(|row| row.get(key))
            .map(String::as_str)
    }

    /// Upsert a digest. A `get` for the same pair in this process returns
    /// the new value immediately.
    pub fn put(&mut self, task_id: &str, key: &str, digest: String) {
        let row = self.entries.entry(task_id.to_string()).or_default();
        if row.get(key).map(String::as_str) != Some(digest.as_str()) {
            row.insert(key.to_string(), digest);
            self.dirty = true;
        }
    }

    /// Persist pending mutations. A no-op when nothing changed.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents =
            serde_yaml::to_string(&self.entries).context("failed to serialize hash store")?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}
