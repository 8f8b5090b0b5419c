//! Typed errors for coordination, lookup, template, and persistence failures.
//!
//! Orchestration code uses `anyhow` for context chaining (as everywhere else
//! in this crate); the variants here exist so the CLI and tests can tell the
//! failure classes apart. `main` downcasts to this type to pick exit codes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The registry server collaborator reported a start failure.
    #[error("failed to start registry server on port {port}: {reason}")]
    ServerStartFailure { port: u16, reason: String },

    /// The server did not answer its port within the configured wait.
    #[error("registry server on port {port} not ready after {waited:?}")]
    ServerStartTimeout { port: u16, waited: Duration },

    /// A `${{ ... }}` token named a variable this tool does not know.
    #[error("unknown template variable '{token}'")]
    UnknownTemplateVariable { token: String },

    /// A recognized variable could not be given a value in this invocation.
    #[error("template variable '{token}' has no value here: {reason}")]
    TemplateValueUnavailable { token: String, reason: String },

    /// An identifier prefix matched more than one run record.
    #[error("identifier prefix '{prefix}' matches {count} run records")]
    AmbiguousIdentifier { prefix: String, count: usize },

    /// An identifier prefix matched no run record.
    #[error("no run record matches '{prefix}'")]
    NotFound { prefix: String },

    /// The user's run returned non-zero, timed out, or never launched.
    #[error("run failed: {detail}")]
    ExecutionFailure {
        exit_code: Option<i32>,
        detail: String,
    },

    /// A staging or history file could not be read back.
    #[error("corrupt persisted state in {path}: {detail}")]
    CorruptPersistedState { path: PathBuf, detail: String },

    /// No `.registrar` directory in the current hierarchy.
    #[error("not a registrar repository (searched upward from {start}); run 'registrar init'")]
    NotARepository { start: PathBuf },
}
