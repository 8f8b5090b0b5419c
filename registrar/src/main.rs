//! Local data-registry coordination CLI.
//!
//! `registrar` keeps a per-project repository (`.registrar/`) of staged
//! artifacts and run history, and coordinates a shared locally hosted
//! registry server across concurrent short-lived invocations.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use registrar::error::Error;
use registrar::exit_codes;
use registrar::io::config::{CliConfig, load_config, write_config};
use registrar::io::history::{History, RunRecord};
use registrar::io::layout::{self, Layout};
use registrar::io::server::ScriptRegistryServer;
use registrar::io::session::SessionCoordinator;
use registrar::io::staging::{StagingFilter, StagingIndex};
use registrar::logging;
use registrar::run::{RunRequest, execute_run};

const STARTER_RUN_CONFIG: &str = r#"# Run configuration for this repository.
# Template tokens such as ${{ USER }} or ${{ DATE }} are resolved over this
# file's text before it is parsed.

[run]
# script = "echo ${{ USER }} started on ${{ DATE }}"
shell = "sh"
"#;

#[derive(Parser)]
#[command(
    name = "registrar",
    version,
    about = "Local registry coordination and run tracking"
)]
struct Cli {
    /// Enable debug diagnostics on stderr.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialise a registrar repository in the current directory.
    Init,
    /// Resolve the run configuration and execute its script.
    Run {
        /// Run configuration file (defaults to `run.toml` at the repo root).
        config: Option<PathBuf>,
        /// Replace the configuration's script with this command text.
        #[arg(long)]
        script: Option<String>,
    },
    /// Mark paths as staged for synchronisation.
    Add { paths: Vec<PathBuf> },
    /// Unmark paths, keeping them tracked.
    Reset { paths: Vec<PathBuf> },
    /// Stop tracking paths; also deletes the files unless --cached.
    Rm {
        paths: Vec<PathBuf>,
        /// Remove from tracking but leave the file on disk.
        #[arg(long)]
        cached: bool,
    },
    /// Show staged and unstaged paths.
    Status,
    /// List run history, newest first.
    Log {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show one run record and its captured output.
    View {
        /// Full identifier or unique prefix.
        identifier: String,
    },
    /// Control the shared registry server directly.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Delete staging and run history for this repository.
    Purge {
        /// Required confirmation; there is no interactive prompt.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum RegistryAction {
    Start,
    Stop,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = dispatch(cli.command) {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::ExecutionFailure { .. }) => exit_codes::RUN_FAILED,
        Some(Error::ServerStartFailure { .. } | Error::ServerStartTimeout { .. }) => {
            exit_codes::SERVER_UNAVAILABLE
        }
        _ => exit_codes::INVALID,
    }
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Init => cmd_init(),
        Command::Run { config, script } => cmd_run(config, script),
        Command::Add { paths } => cmd_add(&paths),
        Command::Reset { paths } => cmd_reset(&paths),
        Command::Rm { paths, cached } => cmd_rm(&paths, cached),
        Command::Status => cmd_status(),
        Command::Log { limit } => cmd_log(limit),
        Command::View { identifier } => cmd_view(&identifier),
        Command::Registry { action } => cmd_registry(action),
        Command::Purge { force } => cmd_purge(force),
    }
}

fn open_layout() -> Result<Layout> {
    let cwd = env::current_dir().context("current dir")?;
    Ok(Layout::discover(&cwd)?)
}

fn open_repo() -> Result<(Layout, CliConfig)> {
    let layout = open_layout()?;
    let config = load_config(&layout.config_path())?;
    Ok((layout, config))
}

fn coordinator_for(config: &CliConfig) -> (SessionCoordinator<ScriptRegistryServer>, PathBuf) {
    let home = layout::registry_home(config.registry.home.as_deref());
    let coordinator = SessionCoordinator::new(
        layout::sessions_dir(&home),
        ScriptRegistryServer::new(&home),
        Duration::from_secs(config.registry.start_timeout_secs),
    );
    (coordinator, home)
}

fn read_token(home: &Path) -> Option<String> {
    let contents = fs::read_to_string(layout::token_path(home)).ok()?;
    let token = contents.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn cmd_init() -> Result<()> {
    let cwd = env::current_dir().context("current dir")?;
    let layout = Layout::at_root(&cwd);
    if layout.dir().exists() {
        bail!("registrar repository is already initialised at {}", layout.dir().display());
    }
    fs::create_dir_all(layout.dir())
        .with_context(|| format!("create {}", layout.dir().display()))?;
    write_config(&layout.config_path(), &CliConfig::default())?;
    let run_config = layout.default_run_config();
    if !run_config.exists() {
        fs::write(&run_config, STARTER_RUN_CONFIG)
            .with_context(|| format!("write {}", run_config.display()))?;
    }
    println!(
        "Initialised empty registrar repository in {}",
        layout.dir().display()
    );
    Ok(())
}

fn cmd_run(config_path: Option<PathBuf>, script: Option<String>) -> Result<()> {
    let (layout, config) = open_repo()?;
    let (coordinator, home) = coordinator_for(&config);
    let request = RunRequest {
        config_path: config_path.unwrap_or_else(|| layout.default_run_config()),
        script_override: script,
        token: read_token(&home),
    };
    let outcome = execute_run(&layout, &config, &coordinator, &request)?;
    println!("recorded run {}", outcome.identifier);
    Ok(())
}

fn cmd_add(paths: &[PathBuf]) -> Result<()> {
    let (layout, _) = open_repo()?;
    let mut staging = StagingIndex::load(&layout.staging_path())?;
    for path in paths {
        if !path.exists() {
            bail!("no such file '{}'", path.display());
        }
        staging.stage(&layout.repo_relative(path)?);
    }
    staging.save()
}

fn cmd_reset(paths: &[PathBuf]) -> Result<()> {
    let (layout, _) = open_repo()?;
    let mut staging = StagingIndex::load(&layout.staging_path())?;
    for path in paths {
        staging.unstage(&layout.repo_relative(path)?);
    }
    staging.save()
}

fn cmd_rm(paths: &[PathBuf], cached: bool) -> Result<()> {
    let (layout, _) = open_repo()?;
    let mut staging = StagingIndex::load(&layout.staging_path())?;
    for path in paths {
        let key = layout.repo_relative(path)?;
        if !staging.remove(&key) {
            println!("'{}' is not tracked, so will not be removed", path.display());
            continue;
        }
        if !cached && path.exists() {
            if path.is_dir() {
                fs::remove_dir_all(path)
                    .with_context(|| format!("remove {}", path.display()))?;
            } else {
                fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
            }
        }
    }
    staging.save()
}

fn cmd_status() -> Result<()> {
    let (layout, _) = open_repo()?;
    let staging = StagingIndex::load(&layout.staging_path())?;
    if staging.is_empty() {
        println!("Nothing marked for tracking.");
        return Ok(());
    }
    let staged = staging.list(StagingFilter::Staged);
    let unstaged = staging.list(StagingFilter::Unstaged);
    if !staged.is_empty() {
        println!("Changes to be synchronized:");
        for path in &staged {
            println!("\t\t{path}");
        }
    }
    if !unstaged.is_empty() {
        println!("Files not staged for synchronization:");
        println!("\t(use \"registrar add <file>...\" to stage files)");
        for path in &unstaged {
            println!("\t\t{path}");
        }
    }
    Ok(())
}

fn print_record(record: &RunRecord) {
    println!("run {}", record.identifier);
    println!("Author: {} <{}>", record.author, record.email);
    println!("Date:   {}", record.started_at);
    match record.exit_code {
        Some(0) => {}
        Some(code) => println!("Status: exited with {code}"),
        None => println!("Status: terminated without exit code"),
    }
    println!("\n        {}\n", record.command);
}

fn cmd_log(limit: usize) -> Result<()> {
    let (layout, _) = open_repo()?;
    let history = History::new(layout.history_dir());
    for record in history.list()?.into_iter().take(limit) {
        print_record(&record);
    }
    Ok(())
}

fn cmd_view(identifier: &str) -> Result<()> {
    let (layout, _) = open_repo()?;
    let history = History::new(layout.history_dir());
    let record = history.find(identifier)?;
    print_record(&record);
    print!("{}", history.read_log(&record)?);
    Ok(())
}

fn cmd_registry(action: RegistryAction) -> Result<()> {
    let (_, config) = open_repo()?;
    let (coordinator, _) = coordinator_for(&config);
    match action {
        RegistryAction::Start => {
            println!("Starting local registry server");
            coordinator.start_unmanaged(config.registry.port)
        }
        RegistryAction::Stop => {
            println!("Stopping local registry server");
            coordinator.stop_unmanaged(config.registry.port)
        }
    }
}

fn cmd_purge(force: bool) -> Result<()> {
    let (layout, _) = open_repo()?;
    if !force {
        bail!("pass --force to confirm removing staging and run history");
    }
    match fs::remove_file(layout.staging_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("remove {}", layout.staging_path().display()));
        }
    }
    History::new(layout.history_dir()).purge()?;
    println!("Cleared staging and run history.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_script_override() {
        let cli = Cli::parse_from(["registrar", "run", "--script", "echo hi"]);
        match cli.command {
            Command::Run { config, script } => {
                assert!(config.is_none());
                assert_eq!(script.as_deref(), Some("echo hi"));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_registry_subcommands() {
        let cli = Cli::parse_from(["registrar", "registry", "start"]);
        assert!(matches!(
            cli.command,
            Command::Registry {
                action: RegistryAction::Start
            }
        ));
    }

    #[test]
    fn parse_view_identifier() {
        let cli = Cli::parse_from(["registrar", "view", "ab12"]);
        match cli.command {
            Command::View { identifier } => assert_eq!(identifier, "ab12"),
            _ => panic!("expected view command"),
        }
    }
}
