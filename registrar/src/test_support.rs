//! Test-only helpers: scratch repositories and scripted registry servers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{CliConfig, UserConfig, write_config};
use crate::io::layout::{Layout, REPO_FOLDER};
use crate::io::server::RegistryServer;

/// A scratch registrar repository in a temp directory.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        fs::create_dir_all(temp.path().join(REPO_FOLDER)).context("create repo folder")?;
        let repo = Self { temp };
        let cfg = CliConfig {
            user: UserConfig {
                name: "Test User".to_string(),
                email: "test@example.com".to_string(),
                id: String::new(),
            },
            ..CliConfig::default()
        };
        write_config(&repo.layout().config_path(), &cfg)?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn layout(&self) -> Layout {
        Layout::at_root(self.root())
    }

    /// A sessions directory inside the scratch area (never the real home).
    pub fn sessions_dir(&self) -> PathBuf {
        self.root().join("sessions")
    }

    /// Write a run configuration and return its path.
    pub fn write_run_config(&self, contents: &str) -> Result<PathBuf> {
        let path = self.layout().default_run_config();
        fs::write(&path, contents).context("write run config")?;
        Ok(path)
    }
}

/// Shared-state fake registry server.
///
/// Clones share one state table, standing in for the one real server that
/// several coordinators (simulated processes) would talk to.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<HashMap<u16, PortState>>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PortState {
    running: bool,
    starts: u32,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, port: u16) -> bool {
        self.state
            .lock()
            .expect("server state")
            .get(&port)
            .is_some_and(|s| s.running)
    }

    /// Times `start` was invoked for `port`.
    pub fn start_count(&self, port: u16) -> u32 {
        self.state
            .lock()
            .expect("server state")
            .get(&port)
            .map_or(0, |s| s.starts)
    }

    /// Simulate the server dying without anyone calling `stop`.
    pub fn crash(&self, port: u16) {
        if let Some(state) = self.state.lock().expect("server state").get_mut(&port) {
            state.running = false;
        }
    }
}

impl RegistryServer for FakeServer {
    fn start(&self, port: u16) -> Result<()> {
        let mut table = self.state.lock().expect("server state");
        let state = table.entry(port).or_default();
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    fn stop(&self, port: u16) -> Result<()> {
        let mut table = self.state.lock().expect("server state");
        if let Some(state) = table.get_mut(&port) {
            state.running = false;
        }
        Ok(())
    }

    fn probe(&self, port: u16) -> bool {
        self.is_running(port)
    }
}

/// Server whose start command always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingServer;

impl RegistryServer for FailingServer {
    fn start(&self, _port: u16) -> Result<()> {
        Err(anyhow!("start script exploded"))
    }

    fn stop(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    fn probe(&self, _port: u16) -> bool {
        false
    }
}

/// Server whose start command succeeds but that never answers its port.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReadyServer;

impl RegistryServer for NeverReadyServer {
    fn start(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    fn probe(&self, _port: u16) -> bool {
        false
    }
}
