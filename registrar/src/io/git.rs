//! Read-only git facts for template resolution.
//!
//! The repository's git metadata feeds the `GIT_*` template variables. This
//! tool never writes to git; it keeps a small, explicit wrapper around `git`
//! subprocess calls and treats every fact as optional — a fact that cannot
//! be resolved only matters if a template token asks for it.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::template::GitFacts;

/// Wrapper for querying git in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD"));
        }
        Ok(name)
    }

    /// URL of the named remote.
    pub fn remote_url(&self, remote: &str) -> Result<String> {
        let out = self.run_capture(&["remote", "get-url", remote])?;
        Ok(out.trim().to_string())
    }

    /// Most recent tag reachable from HEAD.
    pub fn latest_tag(&self) -> Result<String> {
        let out = self.run_capture(&["describe", "--tags", "--abbrev=0"])?;
        Ok(out.trim().to_string())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Collect all git facts once, best-effort.
#[instrument(skip_all, fields(workdir = %workdir.display(), remote))]
pub fn collect_facts(workdir: &Path, remote: &str) -> GitFacts {
    let git = Git::new(workdir);
    let mut facts = GitFacts::default();

    match git.current_branch() {
        Ok(branch) => facts.branch = Some(branch),
        Err(err) => debug!(err = %err, "no git branch fact"),
    }
    match git.remote_url(remote) {
        Ok(url) => facts.remote_url = Some(url),
        Err(err) => debug!(err = %err, "no git remote fact"),
    }
    match git.latest_tag() {
        Ok(tag) => facts.latest_tag = Some(tag),
        Err(err) => debug!(err = %err, "no git tag fact"),
    }

    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn git_in(root: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(root)
            .output()
            .expect("run git");
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn init_repo(root: &Path) {
        git_in(root, &["init"]);
        git_in(root, &["checkout", "-b", "work"]);
        git_in(root, &["config", "user.email", "test@example.com"]);
        git_in(root, &["config", "user.name", "Test"]);
        std::fs::write(root.join("file.txt"), "contents").expect("write");
        git_in(root, &["add", "."]);
        git_in(root, &["commit", "-m", "initial"]);
    }

    #[test]
    fn collects_branch_and_tag_facts() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        git_in(temp.path(), &["tag", "v0.1.0"]);

        let facts = collect_facts(temp.path(), "origin");
        assert_eq!(facts.branch.as_deref(), Some("work"));
        assert_eq!(facts.latest_tag.as_deref(), Some("v0.1.0"));
        // No remote configured in this scratch repo.
        assert_eq!(facts.remote_url, None);
    }

    #[test]
    fn facts_default_to_none_outside_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        let facts = collect_facts(temp.path(), "origin");
        assert_eq!(facts, GitFacts::default());
    }
}
