//! Stable exit codes for conductor CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Infrastructure or unexpected error.
pub const ERROR: i32 = 1;
/// Broken setup: invalid config, unknown stage or check, missing or duplicate pipeline.
pub const PRECONDITION: i32 = 2;
