//! Atomic full-file replacement shared by all persisted state.
//!
//! Every mutation of staging, history, and configuration rewrites the whole
//! file through a temp file + rename, so a crash mid-write can never leave a
//! partially written file behind. Concurrent writers serialize at the rename
//! boundary; the last writer wins.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to `path` via temp file + rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        write_atomic(&path, "first").expect("write");
        write_atomic(&path, "second").expect("rewrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        assert!(!path.with_extension("tmp").exists());
    }
}
