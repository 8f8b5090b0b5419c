//! Registry server collaborator boundary.
//!
//! The registry itself is a separate service with its own HTTP API; this
//! module only knows how to start it, stop it, and probe whether something
//! answers on its port. The [`RegistryServer`] trait decouples session
//! coordination from the real installation so tests can substitute scripted
//! servers without spawning processes.

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument};

use crate::io::process::run_command_with_timeout;

/// Abstraction over the shared registry server installation.
pub trait RegistryServer {
    /// Request a server start on `port`. Returns once the start command has
    /// completed; readiness is observed separately through [`Self::probe`].
    fn start(&self, port: u16) -> Result<()>;

    /// Request a server stop. Stopping a server that is not running is not
    /// an error; concurrent releases may both reach this call.
    fn stop(&self, port: u16) -> Result<()>;

    /// Best-effort liveness probe, independent of any bookkeeping.
    fn probe(&self, port: u16) -> bool;
}

/// Production implementation: the registry installation's control scripts.
///
/// The installation directory is expected to provide
/// `scripts/start_registry` and `scripts/stop_registry`, each accepting
/// `-p <port>`.
#[derive(Debug, Clone)]
pub struct ScriptRegistryServer {
    home: PathBuf,
}

/// How long a control script may take before we give up on it.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);
const SCRIPT_OUTPUT_LIMIT: usize = 64 * 1024;

impl ScriptRegistryServer {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    fn script(&self, name: &str) -> Result<PathBuf> {
        let path = self.home.join("scripts").join(name);
        if !path.exists() {
            return Err(anyhow!(
                "registry control script {} not found; is the local registry installed?",
                path.display()
            ));
        }
        Ok(path)
    }

    fn run_script(&self, name: &str, port: u16) -> Result<()> {
        let script = self.script(name)?;
        debug!(script = %script.display(), port, "running registry control script");
        let mut cmd = Command::new(&script);
        cmd.arg("-p").arg(port.to_string());
        let output = run_command_with_timeout(cmd, SCRIPT_TIMEOUT, SCRIPT_OUTPUT_LIMIT)?;
        if output.timed_out {
            return Err(anyhow!("{name} did not finish within {SCRIPT_TIMEOUT:?}"));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{name} failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

impl RegistryServer for ScriptRegistryServer {
    #[instrument(skip_all, fields(port))]
    fn start(&self, port: u16) -> Result<()> {
        info!(port, "starting local registry server");
        self.run_script("start_registry", port)
    }

    #[instrument(skip_all, fields(port))]
    fn stop(&self, port: u16) -> Result<()> {
        info!(port, "stopping local registry server");
        self.run_script("stop_registry", port)
    }

    fn probe(&self, port: u16) -> bool {
        tcp_probe(port)
    }
}

/// Probe a local port with a short connect timeout.
///
/// Accepting a TCP connection is enough to tell a live server from a dead
/// one; speaking its HTTP API belongs to other layers.
pub fn tcp_probe(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(250)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_script_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let server = ScriptRegistryServer::new(temp.path());
        let err = server.start(8000).unwrap_err();
        assert!(err.to_string().contains("start_registry"));
    }

    #[test]
    fn probe_is_false_on_a_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(tcp_probe(port));
        drop(listener);
        assert!(!tcp_probe(port));
    }
}
