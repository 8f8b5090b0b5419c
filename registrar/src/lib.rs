//! Local repository and session coordination for a locally hosted data registry.
//!
//! Every `registrar` invocation is a short-lived process; many may run
//! concurrently against the same project and the same shared registry server.
//! The crate enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (content-derived run identifiers,
//!   template variable resolution). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (repository layout, persisted
//!   staging and history state, session markers, the registry-server boundary,
//!   subprocess execution, git facts).
//!
//! [`run`] composes core logic with I/O to implement the `run` command; the
//! remaining CLI commands are thin wrappers over individual [`io`] modules.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
