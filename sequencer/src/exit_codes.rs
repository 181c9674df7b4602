//! Stable exit codes for sequencer CLI commands.
//!
//! `sequencer run` otherwise exits with the job exit code (that of the last
//! step that ran), so training failures pass through unchanged.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, usage, or an error before any step ran.
pub const INVALID: i32 = 1;
/// A step was killed at the job deadline (same code as `timeout(1)`).
pub const TIMED_OUT: i32 = 124;
/// A step's program exists but could not be executed.
pub const NOT_EXECUTABLE: i32 = 126;
/// A step's program could not be found on the child `PATH`.
pub const COMMAND_NOT_FOUND: i32 = 127;
