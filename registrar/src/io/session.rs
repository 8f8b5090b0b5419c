//! Cross-process session coordination for the shared registry server.
//!
//! Every CLI process that needs the registry writes a marker file into the
//! sessions directory; the server keeps running while at least one marker
//! belongs to a live process. Coordination is filesystem-based because the
//! holders are independent processes: marker creation uses create-new
//! semantics and an exclusive `server.lock` file gates which process
//! actually runs the start command, so two racing invocations never
//! double-start the server. Markers (and a start lock) owned by dead
//! processes are reclaimed before they are counted, which is how the
//! coordinator recovers from killed invocations.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::Error;
use crate::io::server::RegistryServer;

/// Name of the exclusive start gate inside the sessions directory.
const START_LOCK: &str = "server.lock";

/// One process's claim that the server must stay up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMarker {
    pub pid: u32,
    pub created_at: String,
    pub port: u16,
}

/// Proof of an acquired session. Pass back to
/// [`SessionCoordinator::release`] exactly once; consuming the handle makes
/// a double release unrepresentable, and releasing after the marker was
/// externally removed is a no-op.
#[derive(Debug)]
pub struct SessionHandle {
    marker_path: PathBuf,
    port: u16,
}

impl SessionHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }
}

/// Reference-counted access to the shared registry server.
#[derive(Debug)]
pub struct SessionCoordinator<S> {
    sessions_dir: PathBuf,
    server: S,
    start_timeout: Duration,
    poll_interval: Duration,
}

impl<S: RegistryServer> SessionCoordinator<S> {
    pub fn new(sessions_dir: impl Into<PathBuf>, server: S, start_timeout: Duration) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            server,
            start_timeout,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    /// Best-effort liveness, independent of marker state.
    pub fn is_server_live(&self, port: u16) -> bool {
        self.server.probe(port)
    }

    /// Ensure the server is running on `port` and register this process as
    /// a holder.
    ///
    /// The marker is written before any start attempt so a concurrent
    /// release can never observe zero holders while a start is in flight;
    /// if the start fails or times out the marker is removed again, leaving
    /// no reference behind.
    #[instrument(skip_all, fields(port))]
    pub fn acquire(&self, port: u16) -> Result<SessionHandle> {
        fs::create_dir_all(&self.sessions_dir)
            .with_context(|| format!("create sessions dir {}", self.sessions_dir.display()))?;
        self.reclaim_stale()?;

        let marker_path = self.write_marker(port)?;
        debug!(marker = %marker_path.display(), "session marker written");

        // Probe regardless of other markers: markers approximate liveness,
        // the probe decides it. A server that died under live markers gets
        // restarted here instead of being assumed up.
        if !self.server.probe(port) {
            if let Err(err) = self.ensure_server(port) {
                let _ = fs::remove_file(&marker_path);
                return Err(err);
            }
        }

        Ok(SessionHandle { marker_path, port })
    }

    /// Drop this process's claim; stops the server when no live claims
    /// remain.
    #[instrument(skip_all, fields(port = handle.port))]
    pub fn release(&self, handle: SessionHandle) -> Result<()> {
        match fs::remove_file(&handle.marker_path) {
            Ok(()) => debug!(marker = %handle.marker_path.display(), "session marker removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("session marker was already removed externally");
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("remove session marker {}", handle.marker_path.display())
                });
            }
        }

        self.reclaim_stale()?;
        if self.marker_paths()?.is_empty() {
            if self.server.probe(handle.port) {
                info!(port = handle.port, "last session released, stopping server");
                self.server
                    .stop(handle.port)
                    .context("stop registry server")?;
            }
        } else {
            debug!("other sessions still hold the server");
        }
        Ok(())
    }

    /// Number of markers after reclaiming dead owners.
    pub fn live_sessions(&self) -> Result<usize> {
        self.reclaim_stale()?;
        Ok(self.marker_paths()?.len())
    }

    /// Explicit `registry start`: bring the server up without holding a
    /// session, refusing when it is already live.
    pub fn start_unmanaged(&self, port: u16) -> Result<()> {
        if self.server.probe(port) {
            anyhow::bail!("registry server is already running on port {port}");
        }
        fs::create_dir_all(&self.sessions_dir)
            .with_context(|| format!("create sessions dir {}", self.sessions_dir.display()))?;
        self.ensure_server(port)
    }

    /// Explicit `registry stop`: refuse while live sessions still need the
    /// server.
    pub fn stop_unmanaged(&self, port: u16) -> Result<()> {
        self.reclaim_stale()?;
        let holders = self.marker_paths()?.len();
        if holders > 0 {
            anyhow::bail!("{holders} active session(s) still require the registry server");
        }
        if !self.server.probe(port) {
            anyhow::bail!("registry server is not running on port {port}");
        }
        self.server.stop(port).context("stop registry server")
    }

    /// Start the server through the exclusive gate, or wait for whoever
    /// holds the gate, until ready or the deadline passes.
    fn ensure_server(&self, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.start_timeout;
        loop {
            if self.server.probe(port) {
                return Ok(());
            }
            match self.try_claim_start_lock()? {
                Some(lock_path) => {
                    info!(port, "this process starts the registry server");
                    let started = self.server.start(port);
                    let result = match started {
                        Ok(()) => {
                            if self.wait_until_ready(port, deadline) {
                                Ok(())
                            } else {
                                Err(Error::ServerStartTimeout {
                                    port,
                                    waited: self.start_timeout,
                                }
                                .into())
                            }
                        }
                        Err(err) => Err(Error::ServerStartFailure {
                            port,
                            reason: format!("{err:#}"),
                        }
                        .into()),
                    };
                    let _ = fs::remove_file(&lock_path);
                    return result;
                }
                None => {
                    // Another process holds the gate; wait for readiness.
                    if Instant::now() >= deadline {
                        return Err(Error::ServerStartTimeout {
                            port,
                            waited: self.start_timeout,
                        }
                        .into());
                    }
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }

    /// Atomically claim the start gate. Returns `None` when another live
    /// process holds it; a gate left behind by a dead process is reclaimed
    /// so the next loop iteration can claim it.
    fn try_claim_start_lock(&self) -> Result<Option<PathBuf>> {
        let path = self.sessions_dir.join(START_LOCK);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())
                    .with_context(|| format!("write start lock {}", path.display()))?;
                Ok(Some(path))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Ok(contents) = fs::read_to_string(&path)
                    && let Ok(pid) = contents.trim().parse::<u32>()
                    && !process_alive(pid)
                {
                    warn!(pid, "reclaiming start lock from dead process");
                    // Losing this race to another reclaimer is fine.
                    let _ = fs::remove_file(&path);
                }
                Ok(None)
            }
            Err(err) => {
                Err(err).with_context(|| format!("create start lock {}", path.display()))
            }
        }
    }

    fn wait_until_ready(&self, port: u16, deadline: Instant) -> bool {
        loop {
            if self.server.probe(port) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Write this process's marker with a collision-free name.
    fn write_marker(&self, port: u16) -> Result<PathBuf> {
        let pid = std::process::id();
        let marker = SessionMarker {
            pid,
            created_at: Utc::now().to_rfc3339(),
            port,
        };
        let mut contents = serde_json::to_string_pretty(&marker).context("serialize marker")?;
        contents.push('\n');

        // One process may hold several sessions (tests simulate many); a
        // sequence suffix keeps names unique under create-new semantics.
        for sequence in 0..u32::MAX {
            let path = self.sessions_dir.join(format!("{pid}-{sequence}.json"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(contents.as_bytes())
                        .with_context(|| format!("write session marker {}", path.display()))?;
                    return Ok(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create session marker {}", path.display()));
                }
            }
        }
        unreachable!("session marker name space exhausted");
    }

    /// Remove markers whose owning process no longer exists. Racing another
    /// reclaimer over the same dead marker is harmless: deleting an
    /// already-deleted file is ignored.
    fn reclaim_stale(&self) -> Result<()> {
        for path in self.marker_paths()? {
            match read_marker(&path) {
                Ok(marker) => {
                    if process_alive(marker.pid) {
                        continue;
                    }
                    info!(pid = marker.pid, marker = %path.display(), "reclaiming stale session");
                    remove_ignoring_missing(&path)?;
                }
                Err(err) => {
                    // An unreadable marker can never prove its owner is
                    // alive, and left in place it would block shutdown
                    // forever.
                    warn!(marker = %path.display(), err = %err, "removing unreadable session marker");
                    remove_ignoring_missing(&path)?;
                }
            }
        }
        Ok(())
    }

    fn marker_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let entries = match fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("read sessions dir {}", self.sessions_dir.display())
                });
            }
        };
        for entry in entries {
            let entry = entry.context("read sessions dir entry")?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn read_marker(path: &Path) -> Result<SessionMarker> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read marker {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse marker {}", path.display()))
}

fn remove_ignoring_missing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn process_alive(pid: u32) -> bool {
    psutil::process::Process::new(pid).is_ok()
}
