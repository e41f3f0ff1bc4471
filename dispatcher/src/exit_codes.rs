//! Stable exit codes for dispatcher CLI commands.

/// Command succeeded; `run` shut down with no task in flight.
pub const OK: i32 = 0;
/// Invalid config, failed startup, or any other error.
pub const INVALID: i32 = 1;
/// The referenced task id does not exist.
pub const NOT_FOUND: i32 = 2;
/// `run` gave up waiting for an in-flight task during shutdown.
pub const SHUTDOWN_TIMEOUT: i32 = 3;
