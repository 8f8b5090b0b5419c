//! Repository and registry filesystem layout.
//!
//! A project's tracking state lives in a `.registrar/` directory at the
//! repository root, discovered by walking upward from the working directory.
//! The shared registry installation lives in a per-user home directory,
//! independent of any one project.

use std::env;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::error::Error;

/// Name of the per-project tracking directory.
pub const REPO_FOLDER: &str = ".registrar";

/// Environment override for the registry home directory.
pub const HOME_ENV: &str = "REGISTRAR_HOME";

/// Paths of one registrar repository.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Locate the closest repository at or above `start`.
    pub fn discover(start: &Path) -> Result<Self, Error> {
        let mut current = start.to_path_buf();
        loop {
            if current.join(REPO_FOLDER).is_dir() {
                debug!(root = %current.display(), "repository located");
                return Ok(Self { root: current });
            }
            if !current.pop() {
                return Err(Error::NotARepository {
                    start: start.to_path_buf(),
                });
            }
        }
    }

    /// Use `root` directly as the repository root (init, tests).
    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.registrar` directory itself.
    pub fn dir(&self) -> PathBuf {
        self.root.join(REPO_FOLDER)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir().join("config.toml")
    }

    pub fn staging_path(&self) -> PathBuf {
        self.dir().join("staging.json")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.dir().join("history")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.dir().join("jobs")
    }

    /// Default user run configuration at the repository root.
    pub fn default_run_config(&self) -> PathBuf {
        self.root.join("run.toml")
    }

    /// Normalize `path` into the repo-relative, `/`-separated key used by the
    /// staging index, so the same file staged from different working
    /// directories maps to one entry.
    pub fn repo_relative(&self, path: &Path) -> Result<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir().context("current dir")?.join(path)
        };
        let normalized = normalize_lexically(&absolute);
        let relative = normalized.strip_prefix(&self.root).map_err(|_| {
            anyhow!(
                "path {} is outside the repository {}",
                path.display(),
                self.root.display()
            )
        })?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Registry home: `$REGISTRAR_HOME`, then the configured value, then
/// `~/.registrar`.
pub fn registry_home(configured: Option<&Path>) -> PathBuf {
    if let Ok(env_home) = env::var(HOME_ENV)
        && !env_home.is_empty()
    {
        return PathBuf::from(env_home);
    }
    if let Some(home) = configured {
        return home.to_path_buf();
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".registrar")
}

/// Directory of per-process session markers under the registry home.
pub fn sessions_dir(registry_home: &Path) -> PathBuf {
    registry_home.join("sessions")
}

/// Local registry access token file under the registry home.
pub fn token_path(registry_home: &Path) -> PathBuf {
    registry_home.join("token")
}
