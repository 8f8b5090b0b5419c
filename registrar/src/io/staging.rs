//! Staging index: which repository paths are marked for synchronization.
//!
//! The index is a JSON object mapping repo-relative paths to a staged flag.
//! A path absent from the index is implicitly unstaged. Every mutating
//! command loads the file, applies its change, and rewrites the whole file
//! atomically; concurrent invocations serialize at the rename boundary with
//! last-writer-wins. Simultaneous staging changes are not merged — an
//! accepted limitation at the concurrency this tool sees in practice.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::error::Error;
use crate::io::atomic::write_atomic;

/// Which entries `list` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingFilter {
    Staged,
    Unstaged,
    All,
}

/// In-memory view of the persisted staging index.
#[derive(Debug, Clone)]
pub struct StagingIndex {
    path: PathBuf,
    entries: BTreeMap<String, bool>,
}

impl StagingIndex {
    /// Load the index from `path`; a missing file is an empty index.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path: path.to_path_buf(),
                    entries: BTreeMap::new(),
                });
            }
            Err(err) => {
                return Err(Error::CorruptPersistedState {
                    path: path.to_path_buf(),
                    detail: format!("unreadable: {err}"),
                });
            }
        };
        let entries: BTreeMap<String, bool> =
            serde_json::from_str(&contents).map_err(|err| Error::CorruptPersistedState {
                path: path.to_path_buf(),
                detail: format!("not a path -> staged map: {err}"),
            })?;
        debug!(path = %path.display(), entries = entries.len(), "staging index loaded");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Mark `key` staged, creating the entry if absent.
    pub fn stage(&mut self, key: &str) {
        self.entries.insert(key.to_string(), true);
    }

    /// Mark `key` unstaged, creating the entry if absent.
    pub fn unstage(&mut self, key: &str) {
        self.entries.insert(key.to_string(), false);
    }

    pub fn is_staged(&self, key: &str) -> bool {
        self.entries.get(key).copied().unwrap_or(false)
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Delete the entry entirely; returns whether it existed.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Entries matching `filter`, in lexicographic order.
    pub fn list(&self, filter: StagingFilter) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, staged)| match filter {
                StagingFilter::Staged => **staged,
                StagingFilter::Unstaged => !**staged,
                StagingFilter::All => true,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the full index atomically.
    pub fn save(&self) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.entries)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}
