//! Stable exit codes for registrar CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, configuration, template, lookup, or persisted state.
pub const INVALID: i32 = 1;
/// The executed run returned non-zero or could not be launched.
pub const RUN_FAILED: i32 = 2;
/// The shared registry server could not be started or reached in time.
pub const SERVER_UNAVAILABLE: i32 = 3;
