//! CLI configuration (`.registrar/config.toml`) and the user run configuration.
//!
//! Both files are TOML and intended to be edited by humans. The CLI
//! configuration describes the invoking user, the shared registry, and
//! execution limits; the run configuration (`run.toml` by default) describes
//! what a single `run` invocation should execute. Template tokens in the run
//! configuration are resolved over its raw text before parsing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// CLI configuration (TOML). Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CliConfig {
    pub user: UserConfig,
    pub registry: RegistryConfig,
    pub git: GitConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserConfig {
    /// Author recorded in run history.
    pub name: String,
    pub email: String,
    /// Stable user identifier (ORCID-like), used for `USER_ID`.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Port the shared local registry server listens on.
    pub port: u16,
    /// Registry installation directory; defaults to `~/.registrar`.
    pub home: Option<PathBuf>,
    /// Bounded wait for the server to answer after a start request.
    pub start_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Remote whose URL feeds the `GIT_REMOTE` template variable.
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock budget for one run script, in seconds.
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            email: String::new(),
            id: String::new(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            home: None,
            start_timeout_secs: 30,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 24 * 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl CliConfig {
    pub fn validate(&self) -> Result<()> {
        if self.registry.port == 0 {
            return Err(anyhow!("registry.port must be > 0"));
        }
        if self.registry.start_timeout_secs == 0 {
            return Err(anyhow!("registry.start_timeout_secs must be > 0"));
        }
        if self.git.remote.trim().is_empty() {
            return Err(anyhow!("git.remote must be non-empty"));
        }
        if self.execution.timeout_secs == 0 {
            return Err(anyhow!("execution.timeout_secs must be > 0"));
        }
        if self.execution.output_limit_bytes == 0 {
            return Err(anyhow!("execution.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load CLI config from a TOML file; missing file means defaults.
pub fn load_config(path: &Path) -> Result<CliConfig> {
    if !path.exists() {
        let cfg = CliConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CliConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write CLI config to disk.
pub fn write_config(path: &Path, cfg: &CliConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// User run configuration, parsed after template resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RunConfig {
    pub run: RunSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RunSection {
    /// Inline script text, written out to the job directory before execution.
    pub script: Option<String>,
    /// Path to an existing script file, copied into the job directory.
    pub script_path: Option<PathBuf>,
    /// Shell label from the fixed table in [`crate::run`]; defaults to `sh`.
    pub shell: Option<String>,
}

/// Parse resolved run configuration text.
pub fn parse_run_config(text: &str, source: &Path) -> Result<RunConfig> {
    toml::from_str(text).with_context(|| format!("parse run configuration {}", source.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CliConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = CliConfig {
            user: UserConfig {
                name: "Ada".to_string(),
                ..UserConfig::default()
            },
            registry: RegistryConfig {
                port: 8124,
                ..RegistryConfig::default()
            },
            ..CliConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_port_is_rejected() {
        let cfg = CliConfig {
            registry: RegistryConfig {
                port: 0,
                ..RegistryConfig::default()
            },
            ..CliConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn run_config_reads_script_fields() {
        let cfg = parse_run_config(
            "[run]\nscript = \"echo hi\"\nshell = \"bash\"\n",
            Path::new("run.toml"),
        )
        .expect("parse");
        assert_eq!(cfg.run.script.as_deref(), Some("echo hi"));
        assert_eq!(cfg.run.shell.as_deref(), Some("bash"));
        assert!(cfg.run.script_path.is_none());
    }

    #[test]
    fn empty_run_config_parses_to_defaults() {
        let cfg = parse_run_config("", Path::new("run.toml")).expect("parse");
        assert_eq!(cfg, RunConfig::default());
    }
}
