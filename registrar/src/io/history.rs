//! Append-only run history keyed by content-derived identifiers.
//!
//! Each completed run leaves two files in `.registrar/history/`: a JSON
//! record (`<id>.json`) and the captured output (`<id>.log`). Records are
//! never mutated; re-recording byte-identical output is a no-op success
//! because the identifier already names that exact output. Only an explicit
//! `purge` removes history.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::identifier::{match_prefix, run_identifier};
use crate::error::Error;
use crate::io::atomic::write_atomic;

/// Persisted description of one executed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub identifier: String,
    pub author: String,
    pub email: String,
    /// Command line the run was launched with.
    pub command: String,
    pub working_dir: String,
    /// Exit code of the run; `None` when the process died without one.
    pub exit_code: Option<i32>,
    /// RFC 3339 start time (UTC).
    pub started_at: String,
    pub duration_secs: f64,
    /// History-relative name of the captured output log.
    pub log_file: String,
}

/// Inputs for recording one run.
#[derive(Debug)]
pub struct RunDraft<'a> {
    pub author: &'a str,
    pub email: &'a str,
    pub command: &'a str,
    pub working_dir: &'a Path,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub stdout: &'a [u8],
    pub stderr: &'a [u8],
}

/// The on-disk history store.
#[derive(Debug, Clone)]
pub struct History {
    dir: PathBuf,
}

impl History {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Record a run, returning its identifier.
    ///
    /// The identifier is derived from the captured output alone; if a record
    /// with that identifier already exists this is a no-op success.
    pub fn record(&self, draft: &RunDraft<'_>) -> Result<String> {
        let identifier = run_identifier(draft.stdout, draft.stderr);
        let record_path = self.record_path(&identifier);
        if record_path.exists() {
            debug!(identifier = %identifier, "output already recorded");
            return Ok(identifier);
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create history directory {}", self.dir.display()))?;

        let log_file = format!("{identifier}.log");
        let record = RunRecord {
            identifier: identifier.clone(),
            author: draft.author.to_string(),
            email: draft.email.to_string(),
            command: draft.command.to_string(),
            working_dir: draft.working_dir.display().to_string(),
            exit_code: draft.exit_code,
            started_at: draft.started_at.to_rfc3339(),
            duration_secs: draft.duration.as_secs_f64(),
            log_file: log_file.clone(),
        };

        fs::write(self.dir.join(&log_file), render_log(draft))
            .with_context(|| format!("write run log {log_file}"))?;

        let mut buf = serde_json::to_string_pretty(&record).context("serialize run record")?;
        buf.push('\n');
        write_atomic(&record_path, &buf)?;

        info!(identifier = %identifier, exit_code = ?draft.exit_code, "run recorded");
        Ok(identifier)
    }

    /// All records, newest first. Recomputed from disk on every call.
    pub fn list(&self) -> Result<Vec<RunRecord>, Error> {
        let mut records = Vec::new();
        for identifier in self.identifiers()? {
            records.push(self.load(&identifier)?);
        }
        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(records)
    }

    /// Look a record up by full identifier or unique prefix.
    pub fn find(&self, prefix: &str) -> Result<RunRecord, Error> {
        let identifiers = self.identifiers()?;
        let matched = match_prefix(identifiers.iter().map(String::as_str), prefix)?;
        self.load(&matched)
    }

    /// Captured output for a record.
    pub fn read_log(&self, record: &RunRecord) -> Result<String> {
        let path = self.dir.join(&record.log_file);
        fs::read_to_string(&path).with_context(|| format!("read run log {}", path.display()))
    }

    /// Delete the whole history store.
    pub fn purge(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("remove history {}", self.dir.display()))?;
        }
        Ok(())
    }

    fn record_path(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.json"))
    }

    fn identifiers(&self) -> Result<Vec<String>, Error> {
        let mut identifiers = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(identifiers),
            Err(err) => {
                return Err(Error::CorruptPersistedState {
                    path: self.dir.clone(),
                    detail: format!("unreadable history directory: {err}"),
                });
            }
        };
        for entry in entries {
            let entry = entry.map_err(|err| Error::CorruptPersistedState {
                path: self.dir.clone(),
                detail: format!("unreadable history entry: {err}"),
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(identifier) = name.strip_suffix(".json") {
                identifiers.push(identifier.to_string());
            }
        }
        Ok(identifiers)
    }

    fn load(&self, identifier: &str) -> Result<RunRecord, Error> {
        let path = self.record_path(identifier);
        let contents =
            fs::read_to_string(&path).map_err(|err| Error::CorruptPersistedState {
                path: path.clone(),
                detail: format!("unreadable: {err}"),
            })?;
        serde_json::from_str(&contents).map_err(|err| Error::CorruptPersistedState {
            path,
            detail: format!("not a run record: {err}"),
        })
    }
}

/// Captured-output log: a short metadata header, then stdout and stderr.
fn render_log(draft: &RunDraft<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(draft.stdout.len() + draft.stderr.len() + 256);
    buf.extend_from_slice(b"--------------------------------\n");
    buf.extend_from_slice(
        format!(
            " Commenced = {}\n",
            draft.started_at.format("%a %b %d %H:%M:%S %Y")
        )
        .as_bytes(),
    );
    buf.extend_from_slice(format!(" Author    = {} <{}>\n", draft.author, draft.email).as_bytes());
    buf.extend_from_slice(format!(" Command   = {}\n", draft.command).as_bytes());
    buf.extend_from_slice(b"--------------------------------\n");
    buf.extend_from_slice(draft.stdout);
    if !draft.stderr.is_empty() {
        buf.extend_from_slice(b"\n=== stderr ===\n");
        buf.extend_from_slice(draft.stderr);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft<'a>(stdout: &'a [u8], started_at: DateTime<Utc>) -> RunDraft<'a> {
        RunDraft {
            author: "Ada",
            email: "ada@example.com",
            command: "sh -e run_script",
            working_dir: Path::new("/work"),
            exit_code: Some(0),
            started_at,
            duration: Duration::from_millis(1500),
            stdout,
            stderr: b"",
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn identical_output_records_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = History::new(temp.path().join("history"));

        let first = history.record(&draft(b"same\n", at(0))).expect("record");
        let second = history.record(&draft(b"same\n", at(60))).expect("record");
        assert_eq!(first, second);
        assert_eq!(history.list().expect("list").len(), 1);
    }

    #[test]
    fn list_is_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = History::new(temp.path().join("history"));
        history.record(&draft(b"one\n", at(0))).expect("record");
        history.record(&draft(b"two\n", at(60))).expect("record");
        history.record(&draft(b"three\n", at(120))).expect("record");

        let records = history.list().expect("list");
        assert_eq!(records.len(), 3);
        assert!(records[0].started_at > records[1].started_at);
        assert!(records[1].started_at > records[2].started_at);
    }

    #[test]
    fn find_by_unique_prefix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = History::new(temp.path().join("history"));
        let identifier = history.record(&draft(b"unique\n", at(0))).expect("record");
        history.record(&draft(b"other\n", at(1))).expect("record");

        let found = history.find(&identifier[..4]).expect("find");
        assert_eq!(found.identifier, identifier);
    }

    #[test]
    fn find_reports_missing_and_ambiguous() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = History::new(temp.path().join("history"));
        history.record(&draft(b"a\n", at(0))).expect("record");
        history.record(&draft(b"b\n", at(1))).expect("record");

        assert!(matches!(
            history.find("zzzz_not_a_prefix").unwrap_err(),
            Error::NotFound { .. }
        ));
        // The empty prefix matches every record.
        assert!(matches!(
            history.find("").unwrap_err(),
            Error::AmbiguousIdentifier { count: 2, .. }
        ));
    }

    #[test]
    fn failed_runs_are_recorded_too() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = History::new(temp.path().join("history"));
        let mut failing = draft(b"partial output\n", at(0));
        failing.exit_code = Some(1);

        let identifier = history.record(&failing).expect("record");
        let record = history.find(&identifier).expect("find");
        assert_eq!(record.exit_code, Some(1));
    }

    #[test]
    fn log_contains_header_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = History::new(temp.path().join("history"));
        let identifier = history.record(&draft(b"hello\n", at(0))).expect("record");
        let record = history.find(&identifier).expect("find");
        let log = history.read_log(&record).expect("log");
        assert!(log.contains("Author    = Ada <ada@example.com>"));
        assert!(log.contains("hello"));
    }

    #[test]
    fn corrupt_record_is_surfaced_with_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("history");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(dir.join("deadbeef.json"), "{").expect("write");

        let history = History::new(&dir);
        assert!(matches!(
            history.list().unwrap_err(),
            Error::CorruptPersistedState { .. }
        ));
    }
}
