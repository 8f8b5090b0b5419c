//! Run orchestration: resolve templates, hold a session, execute, record.
//!
//! Template and configuration problems fail before a session is acquired;
//! once a session exists it is released on every path, including execution
//! errors, so a failed run never leaks a reference count against the shared
//! server. A run that executes and fails is still recorded: "the user's run
//! failed" is history, not a tool crash.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::template::{TemplateContext, resolve};
use crate::error::Error;
use crate::io::config::{CliConfig, parse_run_config};
use crate::io::git::collect_facts;
use crate::io::history::{History, RunDraft};
use crate::io::layout::Layout;
use crate::io::process::run_command_with_timeout;
use crate::io::server::RegistryServer;
use crate::io::session::SessionCoordinator;
use crate::io::staging::StagingIndex;

/// Inputs for one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// User run configuration to resolve and execute.
    pub config_path: PathBuf,
    /// Replaces the configuration's `script` when set (`--script`).
    pub script_override: Option<String>,
    /// Local registry access token for the `TOKEN` template variable.
    pub token: Option<String>,
}

/// Result of a completed (successful) run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub identifier: String,
    pub exit_code: i32,
    pub job_dir: PathBuf,
}

/// Execute the run described by `request`.
#[instrument(skip_all, fields(config = %request.config_path.display()))]
pub fn execute_run<S: RegistryServer>(
    layout: &Layout,
    config: &CliConfig,
    coordinator: &SessionCoordinator<S>,
    request: &RunRequest,
) -> Result<RunOutcome> {
    let source_text = fs::read_to_string(&request.config_path).with_context(|| {
        format!("read run configuration {}", request.config_path.display())
    })?;

    let started_at = Utc::now();
    let job_dir = layout
        .jobs_dir()
        .join(started_at.format("%Y-%m-%d_%H_%M_%S_%6f").to_string());
    fs::create_dir_all(&job_dir)
        .with_context(|| format!("create job directory {}", job_dir.display()))?;

    // Everything a token may ask for is gathered up front; resolution itself
    // stays pure.
    let context = TemplateContext {
        now: Local::now(),
        user: config.user.name.clone(),
        user_id: config.user.id.clone(),
        repo_root: layout.root().display().to_string(),
        config_dir: job_dir.display().to_string(),
        source_config: request.config_path.display().to_string(),
        token: request.token.clone(),
        git: collect_facts(layout.root(), &config.git.remote),
    };
    let working_text = resolve(&source_text, &context)?;

    let mut run_config = parse_run_config(&working_text, &request.config_path)?;
    if let Some(script) = &request.script_override {
        debug!("using --script override");
        run_config.run.script = Some(script.clone());
        run_config.run.script_path = None;
    }

    let working_config_path = job_dir.join("run.toml");
    fs::write(&working_config_path, &working_text)
        .with_context(|| format!("write working config {}", working_config_path.display()))?;

    let script_path = materialize_script(&run_config.run.script, &run_config.run.script_path, &job_dir)?;
    let shell = run_config.run.shell.as_deref().unwrap_or("sh");
    let argv = shell_invocation(shell, &script_path)?;
    let command_line = argv
        .iter()
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");

    let handle = coordinator.acquire(config.registry.port)?;

    let result = execute_and_record(layout, config, &argv, &command_line, &job_dir, started_at);

    let released = coordinator.release(handle);
    match (result, released) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!(err = %release_err, "session release failed after run error");
            Err(err)
        }
    }
}

/// The execute-then-record leg; the caller owns session release.
fn execute_and_record(
    layout: &Layout,
    config: &CliConfig,
    argv: &[OsString],
    command_line: &str,
    job_dir: &Path,
    started_at: chrono::DateTime<Utc>,
) -> Result<RunOutcome> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(layout.root())
        .env("REGISTRAR_LOCAL_REPO", layout.root())
        .env("REGISTRAR_CONFIG_DIR", job_dir);

    let timeout = Duration::from_secs(config.execution.timeout_secs);
    let output = match run_command_with_timeout(cmd, timeout, config.execution.output_limit_bytes)
    {
        Ok(output) => output,
        Err(err) => {
            // Execution never started; nothing to record.
            return Err(Error::ExecutionFailure {
                exit_code: None,
                detail: format!("could not launch '{command_line}': {err:#}"),
            }
            .into());
        }
    };

    let history = History::new(layout.history_dir());
    let identifier = history.record(&RunDraft {
        author: &config.user.name,
        email: &config.user.email,
        command: command_line,
        working_dir: layout.root(),
        exit_code: output.status.code(),
        started_at,
        duration: output.duration,
        stdout: &output.stdout,
        stderr: &output.stderr,
    })?;

    let job_key = layout.repo_relative(job_dir)?;
    let mut staging = StagingIndex::load(&layout.staging_path())?;
    staging.stage(&job_key);
    staging.save()?;

    info!(identifier = %identifier, exit_code = ?output.status.code(), "run recorded");

    if output.timed_out {
        return Err(Error::ExecutionFailure {
            exit_code: output.status.code(),
            detail: format!(
                "timed out after {}s (recorded as {})",
                config.execution.timeout_secs,
                &identifier[..8]
            ),
        }
        .into());
    }
    if !output.status.success() {
        return Err(Error::ExecutionFailure {
            exit_code: output.status.code(),
            detail: format!(
                "exited with {:?} (recorded as {})",
                output.status.code(),
                &identifier[..8]
            ),
        }
        .into());
    }

    Ok(RunOutcome {
        identifier,
        exit_code: 0,
        job_dir: job_dir.to_path_buf(),
    })
}

/// Write (or copy) the run script into the job directory.
fn materialize_script(
    script: &Option<String>,
    script_path: &Option<PathBuf>,
    job_dir: &Path,
) -> Result<PathBuf> {
    if let Some(text) = script {
        let path = job_dir.join("run_script");
        fs::write(&path, text).with_context(|| format!("write run script {}", path.display()))?;
        return Ok(path);
    }
    if let Some(source) = script_path {
        if !source.exists() {
            return Err(Error::ExecutionFailure {
                exit_code: None,
                detail: format!("script '{}' was not found", source.display()),
            }
            .into());
        }
        let file_name = source
            .file_name()
            .with_context(|| format!("script path {} has no file name", source.display()))?;
        let path = job_dir.join(file_name);
        fs::copy(source, &path)
            .with_context(|| format!("copy run script into {}", path.display()))?;
        return Ok(path);
    }
    bail!("run configuration needs either 'script' or 'script_path' under [run]")
}

/// Fixed table of shell labels to launch commands.
fn shell_invocation(shell: &str, script: &Path) -> Result<Vec<OsString>> {
    let mut argv: Vec<OsString> = match shell {
        "sh" => vec!["sh".into(), "-e".into()],
        "bash" => vec!["bash".into(), "-eo".into(), "pipefail".into()],
        "python" => vec!["python".into()],
        "python3" => vec!["python3".into()],
        "julia" => vec!["julia".into()],
        "R" => vec!["R".into(), "-f".into()],
        other => bail!(
            "unrecognised shell '{other}' (expected one of: sh, bash, python, python3, julia, R)"
        ),
    };
    argv.push(script.as_os_str().to_os_string());
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_table_covers_default() {
        let argv = shell_invocation("sh", Path::new("/tmp/run_script")).expect("sh");
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "-e");
        assert_eq!(argv[2], "/tmp/run_script");
    }

    #[test]
    fn unknown_shell_is_rejected() {
        let err = shell_invocation("cobol", Path::new("x")).unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn script_text_wins_and_lands_in_job_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = materialize_script(&Some("echo hi".to_string()), &None, temp.path())
            .expect("materialize");
        assert_eq!(fs::read_to_string(path).expect("read"), "echo hi");
    }

    #[test]
    fn missing_script_file_is_an_execution_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = materialize_script(
            &None,
            &Some(temp.path().join("absent.sh")),
            temp.path(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ExecutionFailure { exit_code: None, .. })
        ));
    }

    #[test]
    fn config_without_script_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = materialize_script(&None, &None, temp.path()).unwrap_err();
        assert!(err.to_string().contains("script"));
    }
}
